#![cfg(not(target_arch = "wasm32"))]

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;

use log::{error, info, LevelFilter};

use ukern_runtime::{Runtime, RuntimeConfig};

fn main() {
    setup_diagnostics();

    info!("starting ukern runtime (native)...");

    if let Err(e) = std::panic::catch_unwind(run) {
        error!("runtime terminated abruptly: {:?}", e);
        std::process::exit(1);
    }
}

/// Brings the runtime up with its default configuration, waits for the
/// in-flight resource queue to drain, then shuts it down in order.
fn run() {
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ukern-service-bg")
        .enable_all()
        .build()
        .expect("failed to initialize background tokio runtime");

    let runtime = Runtime::new(RuntimeConfig::default()).expect("failed to initialize runtime");

    tokio_rt.block_on(async {
        runtime.shutdown().await;
    });
}

/// Sets up logging and a crash-dumping panic hook that writes a formatted
/// report to `ukern_crash.log` alongside the stderr dump.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) { LevelFilter::Debug } else { LevelFilter::Warn })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };

        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let crash_msg = format!("=== RUNTIME CRASH ===\nReason: {}\nLocation: {}\n\nStack Trace:\n{}", msg, location, backtrace);

        eprintln!("\x1b[31;1m{}\x1b[0m", crash_msg);

        if let Ok(mut file) = File::create("ukern_crash.log") {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("crash report saved to ukern_crash.log");
        }
    }));
}
