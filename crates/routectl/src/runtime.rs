//! routectl runtime helpers.
//!
//! Builds a routing context on the simulated device layer and drives it from
//! line commands. User commands run on the calling thread; hardware
//! notifications go through the event thread.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};

use audio_route::{Context, RouteError};
use audio_route::hw::sim::SimulatedHardware;

use crate::commands::{self, Command, HELP};
use crate::config::BoardConfig;
use crate::hardware::{self, HardwareHandle};

enum Flow {
    Continue,
    Quit,
}

/// Build a context on simulated hardware configured from the board file.
pub fn build_context(config: &BoardConfig) -> Result<Arc<Context>> {
    let hw = Arc::new(SimulatedHardware::new(config.endpoint_count()));
    hw.set_voice_frequencies(config.sim.voice_tx_hz, config.sim.voice_rx_hz);
    let ctx = Context::new(&config.board(), hw).context("build routing context")?;
    Ok(Arc::new(ctx))
}

/// Validate the board and print a one-line summary.
pub fn run_check(config: &BoardConfig) -> Result<()> {
    let ctx = build_context(config)?;
    let status = ctx.status();
    println!(
        "ok: {} endpoints, {} routes, loopback {}",
        status.endpoints.len(),
        status.routes.len(),
        if status.loopback.is_some() { "configured" } else { "absent" }
    );
    Ok(())
}

/// Print the initial status snapshot.
pub fn run_status(config: &BoardConfig) -> Result<()> {
    let ctx = build_context(config)?;
    print_status(&ctx, &mut std::io::stdout())
}

/// Interactive mode on stdin/stdout. Command errors are reported and the
/// session continues.
pub fn run_interactive(config: &BoardConfig) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    run_session(config, stdin.lock(), &mut stdout, true, false)
}

/// Execute a command file; the first failing line aborts the run.
pub fn run_script(config: &BoardConfig, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("open script {:?}", path))?;
    let mut stdout = std::io::stdout();
    run_session(
        config,
        std::io::BufReader::new(file),
        &mut stdout,
        true,
        true,
    )
}

fn run_session(
    config: &BoardConfig,
    input: impl BufRead,
    out: &mut impl Write,
    install_ctrlc: bool,
    stop_on_error: bool,
) -> Result<()> {
    let ctx = build_context(config)?;
    if install_ctrlc {
        let ctx_for_signal = ctx.clone();
        let _ = ctrlc::set_handler(move || {
            if let Err(err) = ctx_for_signal.shutdown() {
                tracing::warn!(error = %err, "shutdown on signal failed");
            }
            std::process::exit(130);
        });
    }
    let events = hardware::spawn_event_thread(ctx.clone());

    let result = command_loop(&ctx, &events, input, out, stop_on_error);

    events.flush();
    events.stop();
    if let Err(err) = ctx.shutdown() {
        tracing::warn!(error = %err, "teardown reported a hardware failure");
    }
    result
}

fn command_loop(
    ctx: &Context,
    events: &HardwareHandle,
    input: impl BufRead,
    out: &mut impl Write,
    stop_on_error: bool,
) -> Result<()> {
    for (index, line) in input.lines().enumerate() {
        let line = line.context("read command")?;
        let line_no = index + 1;
        let outcome = commands::parse_line(&line)
            .and_then(|cmd| match cmd {
                Some(cmd) => execute(ctx, events, cmd, out),
                None => Ok(Flow::Continue),
            });
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) if stop_on_error => {
                return Err(err.context(format!("line {line_no}: {}", line.trim())));
            }
            Err(err) => {
                let device_fault = err
                    .downcast_ref::<RouteError>()
                    .is_some_and(|route_err| !route_err.is_caller_error());
                if device_fault {
                    tracing::warn!(line = line_no, error = %format!("{err:#}"), "command hit a device failure");
                }
                writeln!(out, "error: {err:#}")?;
            }
        }
    }
    Ok(())
}

fn execute(
    ctx: &Context,
    events: &HardwareHandle,
    cmd: Command,
    out: &mut impl Write,
) -> Result<Flow> {
    if !matches!(cmd, Command::Notify { .. }) {
        events.flush();
    }
    match cmd {
        Command::Start(route) => {
            ctx.start_route(route)?;
            writeln!(out, "{route}: {:?}", ctx.route_state(route)?)?;
        }
        Command::Stop(route) => {
            ctx.stop_route(route)?;
            writeln!(out, "{route}: {:?}", ctx.route_state(route)?)?;
        }
        Command::SetRoute {
            route,
            endpoint,
            bound,
        } => {
            ctx.set_route(route, endpoint, bound)?;
            writeln!(out, "{route}: {:?}", ctx.route_state(route)?)?;
        }
        Command::Session(route) => {
            writeln!(out, "{}", ctx.session_id(route)?.0)?;
        }
        Command::Volume { session, level } => {
            ctx.set_volume(session, level)?;
        }
        Command::Device { endpoint, on } => {
            ctx.set_device(endpoint, on)?;
        }
        Command::Bind {
            endpoint,
            class,
            bound: true,
        } => ctx.bind_class(endpoint, class)?,
        Command::Bind {
            endpoint,
            class,
            bound: false,
        } => ctx.unbind_class(endpoint, class)?,
        Command::Notify { kind, id, payload } => {
            events.notify(kind, id, payload);
        }
        Command::Status => print_status(ctx, out)?,
        Command::Help => writeln!(out, "{HELP}")?,
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn print_status(ctx: &Context, out: &mut impl Write) -> Result<()> {
    let json = serde_json::to_string_pretty(&ctx.status()).context("encode status")?;
    writeln!(out, "{json}")?;
    Ok(())
}

/// Guard used by `main` for an empty board.
pub fn require_endpoints(config: &BoardConfig) -> Result<()> {
    if config.endpoints.is_empty() {
        bail!("board has no endpoints");
    }
    Ok(())
}
