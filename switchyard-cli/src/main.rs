use std::process::ExitCode;

use argh::FromArgs;

use switchyard::session::{Network, Session, SocksAddr};
use switchyard::{app::logger, config, Runtime};

#[derive(FromArgs)]
/// A rule based outbound router.
struct Args {
    /// the configuration file
    #[argh(option, short = 'c', default = "String::from(\"config.json\")")]
    config: String,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Check(CheckArgs),
    Route(RouteArgs),
    UrlTest(UrlTestArgs),
    Run(RunArgs),
}

#[derive(FromArgs)]
/// Validate the configuration and build every component.
#[argh(subcommand, name = "check")]
struct CheckArgs {}

#[derive(FromArgs)]
/// Show which rule and outbound a connection would use.
#[argh(subcommand, name = "route")]
struct RouteArgs {
    /// destination, host:port
    #[argh(positional)]
    destination: String,

    /// tcp or udp
    #[argh(option, short = 'n', default = "Network::Tcp")]
    network: Network,

    /// inbound tag of the connection
    #[argh(option)]
    inbound: Option<String>,

    /// clash mode to match with
    #[argh(option)]
    clash_mode: Option<String>,
}

#[derive(FromArgs)]
/// Probe the members of a group and print their delays.
#[argh(subcommand, name = "urltest")]
struct UrlTestArgs {
    /// the group tag
    #[argh(positional)]
    group: String,
}

#[derive(FromArgs)]
/// Run until interrupted.
#[argh(subcommand, name = "run")]
struct RunArgs {}

fn load(path: &str) -> Result<config::Config, String> {
    config::from_file(path).map_err(|e| format!("load config {}: {:#}", path, e))
}

async fn check(config: config::Config) -> Result<(), String> {
    let rt = Runtime::build(&config, Vec::new()).map_err(|e| e.to_string())?;
    println!(
        "ok: {} outbounds, final [{}]",
        rt.outbounds.handlers().count(),
        rt.router.final_tag()
    );
    Ok(())
}

async fn route(config: config::Config, args: RouteArgs) -> Result<(), String> {
    let destination: SocksAddr = args
        .destination
        .parse()
        .map_err(|e| format!("invalid destination: {}", e))?;
    let rt = Runtime::build(&config, Vec::new()).map_err(|e| e.to_string())?;
    rt.router.start().await.map_err(|e| e.to_string())?;
    if let Some(mode) = args.clash_mode.as_deref() {
        rt.router.set_clash_mode(mode);
    }
    let sess = Session {
        network: args.network,
        destination,
        inbound_tag: args.inbound.unwrap_or_default(),
        ..Default::default()
    };
    let res = rt.router.explain(&sess).await;
    rt.shutdown();
    let diagnostic = res.map_err(|e| e.to_string())?;
    let out = serde_json::to_string_pretty(&diagnostic).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}

async fn url_test(config: config::Config, args: UrlTestArgs) -> Result<(), String> {
    let rt = Runtime::build(&config, Vec::new()).map_err(|e| e.to_string())?;
    let res = rt.outbounds.url_test(&args.group).await;
    rt.shutdown();
    let results = res.map_err(|e| e.to_string())?;
    let out = serde_json::to_string_pretty(&results).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}

#[cfg(feature = "ctrlc")]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("wait for ctrl-c failed: {}", e);
    }
}

#[cfg(not(feature = "ctrlc"))]
async fn wait_for_signal() {
    std::future::pending::<()>().await
}

async fn run(config: config::Config) -> Result<(), String> {
    let _guard = logger::setup_logger(&config.log).map_err(|e| e.to_string())?;
    let rt = switchyard::start(config).await.map_err(|e| e.to_string())?;
    wait_for_signal().await;
    rt.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();
    let config = match load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("create runtime failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let res = rt.block_on(async move {
        match args.command {
            Command::Check(_) => check(config).await,
            Command::Route(a) => route(config, a).await,
            Command::UrlTest(a) => url_test(config, a).await,
            Command::Run(_) => run(config).await,
        }
    });
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
