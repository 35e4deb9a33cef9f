use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use breakwater::{Config, SqlConfig, WebServer};

#[derive(Parser, Debug)]
#[command(name = "breakwater", about = "Epoll-reactor HTTP/1.1 file server")]
struct Args {
    /// Listen port (1024-65535).
    #[arg(short, long, default_value_t = 1316)]
    port: u16,

    /// 0 = both LT, 1 = client ET, 2 = listen ET, 3 = both ET.
    #[arg(short = 'm', long, default_value_t = 3)]
    trigger_mode: u8,

    /// Idle timeout per connection in milliseconds (0 disables).
    #[arg(short, long, default_value_t = 60_000)]
    timeout_ms: u64,

    /// Linger on close of the listen socket.
    #[arg(long, default_value_t = false)]
    linger: bool,

    /// Directory served; defaults to ./resources.
    #[arg(long)]
    src_dir: Option<PathBuf>,

    /// Worker thread count; defaults to the core count.
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Enable the credential store (requires the --sql-* options).
    #[arg(long, default_value_t = false)]
    sql: bool,

    #[arg(long, default_value = "localhost")]
    sql_host: String,

    #[arg(long, default_value_t = 5432)]
    sql_port: u16,

    #[arg(long, default_value = "breakwater")]
    sql_user: String,

    #[arg(long, default_value = "")]
    sql_password: String,

    #[arg(long, default_value = "breakwater")]
    sql_db: String,

    /// SQL handle pool size.
    #[arg(long, default_value_t = 10)]
    sql_pool: usize,

    /// Disable file logging entirely.
    #[arg(long, default_value_t = false)]
    no_log: bool,

    /// 0 = debug, 1 = info, 2 = warn, 3 = error.
    #[arg(long, default_value_t = 1)]
    log_level: u8,

    /// Async log queue length; 0 writes synchronously.
    #[arg(long, default_value_t = 1024)]
    log_queue: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = Config {
        port: args.port,
        trigger_mode: args.trigger_mode,
        timeout_ms: args.timeout_ms,
        linger: args.linger,
        src_dir: args.src_dir,
        worker_threads: args.threads.unwrap_or_else(num_cpus::get),
        sql: args.sql.then(|| SqlConfig {
            host: args.sql_host,
            port: args.sql_port,
            user: args.sql_user,
            password: args.sql_password,
            dbname: args.sql_db,
            pool_size: args.sql_pool,
        }),
        log_enable: !args.no_log,
        log_level: args.log_level,
        log_queue_size: args.log_queue,
        log_dir: PathBuf::from("./log"),
    };

    let mut server = match WebServer::new(cfg) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("breakwater: init failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let handle = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || handle.shutdown()) {
        eprintln!("breakwater: failed to install signal handler: {e}");
        return ExitCode::FAILURE;
    }

    server.run();
    ExitCode::SUCCESS
}
