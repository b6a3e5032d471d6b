use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use log::{LevelFilter, debug, info};
use serde_json::Value;

use shellwire::bus::{self, RequisitionHub, signals};
use shellwire::config::{self, AppConfig};
use shellwire::protocol::cancel_frame;
use shellwire::{
    CommunicationDebugger, Dispatcher, MessageScheduler, RequestDetails, Subscription, ValidationOutcome,
    WebSocketFactory,
};

const APP_NAME: &str = "shellwirectl";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        command => async_main(ctx, command),
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    let session = Session::open(&ctx).await?;
    let result = match command {
        Command::Send(cmd) => handle_send(&ctx, &session, cmd).await,
        Command::Raw(cmd) => handle_raw(&ctx, &session, cmd).await,
        Command::Validate(cmd) => handle_validate(&ctx, &session, cmd).await,
        Command::Cancel(cmd) => handle_cancel(&ctx, &session, cmd).await,
        Command::Watch => handle_watch(&session).await,
        Command::Config { .. } => Ok(()),
    };
    session.scheduler.disconnect().await;
    result
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Shellwire - talk to the shell GUI backend from the command line.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    /// Backend base URL (overrides the config file)
    #[arg(long, value_name = "URL", global = true)]
    url: Option<String>,
    /// Profile name to record in the effective config
    #[arg(long, value_name = "PROFILE", global = true)]
    profile: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a request and print its result
    Send(SendCommand),
    /// Send a wire-format frame as is
    Raw(RawCommand),
    /// Send a wire-format frame and compare the responses with expectations
    Validate(ValidateCommand),
    /// Cancel a running request
    Cancel(CancelCommand),
    /// Print bus signals and dispatcher events until Ctrl-C
    Watch,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct SendCommand {
    /// Request type, e.g. `gui.core.get_backend_information`
    #[arg(value_name = "REQUEST_TYPE")]
    request_type: String,
    /// Parameters as a JSON object in camelCase
    #[arg(long, value_name = "JSON")]
    params: Option<String>,
    /// Send as a direct request instead of an `execute` command
    #[arg(long)]
    direct: bool,
    /// Collect all intermediate results into a list
    #[arg(long)]
    multi: bool,
}

#[derive(Debug, Clone, Args)]
struct RawCommand {
    /// Frame as a JSON object in snake_case
    #[arg(value_name = "JSON")]
    frame: String,
}

#[derive(Debug, Clone, Args)]
struct ValidateCommand {
    /// Frame as a JSON object in snake_case
    #[arg(value_name = "JSON")]
    frame: String,
    /// Expected responses, in order
    #[arg(long = "expect", value_name = "JSON")]
    expect: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct CancelCommand {
    /// Id of the request to cancel
    #[arg(value_name = "REQUEST_ID")]
    request_id: String,
    /// Seconds to wait for the acknowledgement
    #[arg(long, default_value = "3")]
    timeout: u64,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = config::resolve_config_file(common.config.clone())?;
        let config = config::load_or_init_config(&config_file)?
            .with_profile_override(common.profile.clone())
            .with_url_override(common.url.clone());
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("shellwire={level},{APP_NAME}={level}")));

        // `try_init` also installs the `log` bridge that carries the library's records.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.parse().unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn print(&self, value: &Value) -> Result<()> {
        let text = if self.common.json {
            serde_json::to_string(value)
        } else {
            serde_json::to_string_pretty(value)
        }
        .context("serializing output")?;
        println!("{text}");
        Ok(())
    }
}

struct Session {
    scheduler: MessageScheduler,
}

impl Session {
    async fn open(ctx: &RuntimeContext) -> Result<Self> {
        let hub = Arc::new(RequisitionHub::new(APP_NAME));
        hub.install_job_pipeline();
        hub.register(
            signals::SHOW_ERROR,
            bus::callback(|payload| async move {
                log::error!("{}", describe_message(&payload));
                Ok(true)
            }),
        );
        hub.register(
            signals::SHOW_INFO,
            bus::callback(|payload| async move {
                info!("{}", describe_message(&payload));
                Ok(true)
            }),
        );

        let scheduler = MessageScheduler::new(
            ctx.config.scheduler_config(),
            Arc::new(WebSocketFactory),
            hub,
            Arc::new(Dispatcher::new()),
        );
        let target = ctx.config.connect_target()?;
        tracing::info!(url = %target.url, profile = %ctx.config.profile, "connecting");
        scheduler
            .connect(&target)
            .await
            .with_context(|| format!("connecting to {}", target.url))?;
        Ok(Self { scheduler })
    }
}

/// `[title, text]` payloads of `showError`/`showInfo`.
fn describe_message(payload: &Value) -> String {
    match payload.as_array().map(Vec::as_slice) {
        Some([title, text, ..]) => format!(
            "{}: {}",
            title.as_str().unwrap_or_default(),
            text.as_str().unwrap_or_default()
        ),
        _ => payload.to_string(),
    }
}

fn parse_json(text: &str, what: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("parsing {what} as JSON"))
}

async fn handle_send(ctx: &RuntimeContext, session: &Session, cmd: SendCommand) -> Result<()> {
    let mut details = if cmd.direct {
        RequestDetails::direct(cmd.request_type)
    } else {
        RequestDetails::execute(cmd.request_type)
    };
    if let Some(params) = cmd.params {
        details = details.with_parameters(parse_json(&params, "--params")?);
    }
    if cmd.multi {
        details = details.multi_result(true);
    }

    let result = session.scheduler.send_request(details).await?;
    ctx.print(&result.into_value())
}

async fn handle_raw(ctx: &RuntimeContext, session: &Session, cmd: RawCommand) -> Result<()> {
    let frame = parse_json(&cmd.frame, "frame")?;
    let on_data: shellwire::scheduler::DataCallback = Arc::new(|payload, request_id| {
        debug!("intermediate result for {request_id}");
        println!("{payload}");
    });
    let result = session.scheduler.send_raw_request(frame, Some(on_data)).await?;
    ctx.print(&result.into_value())
}

async fn handle_validate(ctx: &RuntimeContext, session: &Session, cmd: ValidateCommand) -> Result<()> {
    let frame = parse_json(&cmd.frame, "frame")?;
    let expected = cmd
        .expect
        .iter()
        .map(|text| parse_json(text, "--expect"))
        .collect::<Result<Vec<_>>>()?;

    let mut output = session
        .scheduler
        .dispatcher()
        .subscribe(Subscription::by_class(shellwire::debugger::DEBUGGER_CLASS).persistent());
    let printer = tokio::spawn(async move {
        while let Some(event) = output.next().await {
            if let Some(text) = event.data.get("output").and_then(Value::as_str) {
                println!("{text}");
            }
        }
    });

    let debugger = CommunicationDebugger::new(session.scheduler.clone(), ctx.config.debugger_config());
    let outcome = debugger.send_and_validate(frame, &expected).await?;
    // Let the printer drain the last lines.
    tokio::task::yield_now().await;
    printer.abort();

    match outcome {
        ValidationOutcome::Succeeded => Ok(()),
        other => Err(anyhow!("validation did not succeed: {other:?}")),
    }
}

async fn handle_cancel(ctx: &RuntimeContext, session: &Session, cmd: CancelCommand) -> Result<()> {
    let ack = tokio::time::timeout(
        Duration::from_secs(cmd.timeout),
        session.scheduler.send_raw_request(cancel_frame(&cmd.request_id), None),
    )
    .await
    .map_err(|_| anyhow!("no acknowledgement for cancel within {} s", cmd.timeout))??;
    ctx.print(&ack.into_value())
}

async fn handle_watch(session: &Session) -> Result<()> {
    let hub = session.scheduler.hub();
    for signal in [
        signals::SOCKET_STATE_CHANGED,
        signals::WEB_SESSION_STARTED,
        signals::DEBUGGER,
    ] {
        hub.register(
            signal,
            bus::callback(move |payload| async move {
                println!("[{signal}] {payload}");
                Ok(false)
            }),
        );
    }

    let mut events = session.scheduler.dispatcher().subscribe(Subscription::all().persistent());
    info!("watching; press Ctrl-C to stop");
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => println!(
                    "[{:?}] {} {}",
                    event.event_type,
                    event.id.as_deref().unwrap_or("-"),
                    event.data
                ),
                None => return Ok(()),
            },
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                return Ok(());
            }
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
    }
}
