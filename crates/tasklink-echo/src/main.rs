use std::process;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tasklink_echo::DemoOptions;

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TASKLINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "tasklink={level},tasklink_echo={level},tasklink::codec=warn"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<DemoOptions, String> {
    let mut options = DemoOptions::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--count" => {
                i += 1;
                let raw = args.get(i).ok_or("--count requires a value")?;
                options.count = raw
                    .parse()
                    .map_err(|_| format!("invalid --count '{raw}'"))?;
            }
            "--timeout-ms" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout-ms requires a value")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout-ms '{raw}'"))?;
                options.timeout = Duration::from_millis(ms);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: tasklink-echo [--count <n>] [--timeout-ms <ms>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --count <n>         Echo tasks to submit [default: 3]");
            eprintln!("  --timeout-ms <ms>   Per-task timeout [default: 5000]");
            process::exit(2);
        }
    };

    init_tracing();
    tracing::info!(count = options.count, "Running echo demo");

    let report = tasklink_echo::run(options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
