use anyhow::Result;
use clap::Parser;
use navigator::{config, logging, pidfile, server};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "config/navigator.yml";

#[derive(Parser)]
#[command(
    name = "navigator",
    about = "Front-end HTTP server that routes multi-tenant traffic to on-demand backend workers",
    disable_version_flag = true
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Send a signal to the running instance; the only accepted value is
    /// 'reload'
    #[arg(short = 's', value_name = "SIGNAL")]
    signal: Option<String>,

    /// Print version and build metadata, then exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn print_version() {
    println!(
        "navigator {} (commit {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("NAVIGATOR_COMMIT").unwrap_or("unknown"),
    );
}

/// `navigator -s reload`: find the running instance through its pid file and
/// send SIGHUP. Success is observed in the running process's log — there is
/// no response channel.
fn send_reload(config_path: &PathBuf) -> i32 {
    let config = match config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("navigator: {e}");
            return 1;
        }
    };
    let Some(pid_path) = config.pidfile else {
        eprintln!(
            "navigator: no pidfile configured in {}",
            config_path.display()
        );
        return 1;
    };
    match pidfile::signal_reload(&pid_path) {
        Ok(()) => {
            println!("reload signal sent");
            0
        }
        Err(e) => {
            eprintln!("navigator: {e}");
            1
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let config_path = args.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    if let Some(signal) = args.signal {
        if signal != "reload" {
            eprintln!("option -s requires 'reload'");
            std::process::exit(1);
        }
        std::process::exit(send_reload(&config_path));
    }

    // Startup configuration errors are fatal; reload errors later are not.
    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("navigator: {e}");
            std::process::exit(1);
        }
    };

    let level = logging::resolve_level(config.log_level.as_deref());
    let _file_guard = logging::init(&level, config.log_file.as_deref());

    server::run(config).await
}
