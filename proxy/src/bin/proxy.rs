//! Keepalive balancer binary.

use balancer::Config;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keepalive-balancer")]
#[command(about = "Reverse proxy that pairs HTTP clients with dial-in keepalive backends")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a config path or use --print-config");
            std::process::exit(1);
        }
    };

    balancer::logging::init(&config.logging);

    let shutdown = match balancer::signal::install_signal_handler() {
        Ok(flag) => flag,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handler");
            std::process::exit(1);
        }
    };

    if let Err(e) = balancer::run(&config, shutdown) {
        tracing::error!(error = %e, "Balancer error");
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# Keepalive Balancer Configuration

# Frontend listener for HTTP clients
cluster_address = "0.0.0.0"
cluster_port = 8080

# Seconds a client may wait while its route has no idle backend
timeout = 6

# Access key (accepted, not enforced)
# key = "secret"

# One entry per backend group. Backends connect to the outgoing addresses.
[[map]]
incoming = ["app.example.com", "www.example.com"]
outgoing = ["127.0.0.1:9000"]
keepalive = true
# Serve requests without a Host header from this group
default = true

[timers]
# Cached clock refresh interval
clock_tick_ms = 1000

# Eviction sweep interval
sweep_interval_ms = 2000

[limits]
# Bytes an unrouted request head may reach before the client is closed
max_request_head = 65536

# Apply the timeout to clients waiting on a specific session id
evict_sticky = true

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"

[shutdown]
# Seconds to keep flushing queued writes after a shutdown signal
drain_timeout_secs = 5
"#;
    print!("{}", config);
}
