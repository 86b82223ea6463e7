use clap::Parser;
use rlsp_gateway::App;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Host-aware reverse proxy with per-IP rate limiting, SSO and response caching"
)]
struct Args {
    /// Path to the gateway configuration; an example file is written there
    /// when missing.
    #[arg(short, long, default_value = "./config.toml")]
    config: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    App::new(args.config).run();
}
