//! Subscribe to a streaming endpoint and print its updates.
//!
//! ```sh
//! cargo run -p stream-subscriber --example subscribe -- \
//!     <BASE_URL> <SERVICE_PATH> <URL> '<ARGUMENTS_JSON>' [FORMAT]
//! ```
//!
//! The bearer token is read from `STREAM_TOKEN`. Push messages are read
//! from stdin as JSON lines (`{"ReferenceId": "...", "Data": ...}`), so a
//! recorded session can be replayed by piping it in. Updates are printed to
//! stdout (pipe to `jq` for formatting).

use std::sync::Arc;
use std::time::Duration;

use stream_subscriber::{
    Event, HttpTransport, HttpTransportConfig, Runtime, StreamingMessage, Subscription,
    SubscriptionConfig, SubscriptionData,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const USAGE: &str = "usage: subscribe <BASE_URL> <SERVICE_PATH> <URL> <ARGUMENTS_JSON> [FORMAT]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let base_url = args.first().ok_or(USAGE)?;
    let service_path = args.get(1).ok_or(USAGE)?;
    let url = args.get(2).ok_or(USAGE)?;
    let arguments: serde_json::Value = serde_json::from_str(args.get(3).ok_or(USAGE)?)?;

    let transport = HttpTransport::new(HttpTransportConfig {
        base_url: base_url.clone(),
        auth_token: std::env::var("STREAM_TOKEN").ok(),
        ..Default::default()
    })?;
    let runtime = Runtime::new(Arc::new(transport));

    let context_id = format!("example-{}", std::process::id());
    let data = SubscriptionData {
        format: args.get(4).cloned(),
        arguments,
        ..Default::default()
    };
    let mut sub = Subscription::new(
        SubscriptionConfig::new(service_path.as_str(), url.as_str(), context_id, data),
        &runtime,
    );

    eprintln!("subscribing to {service_path}/{url} ...");
    sub.on_subscribe()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut orphan_check = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            event = sub.next() => {
                let Some(event) = event else { break };
                match event {
                    Event::Update { data, kind } => {
                        eprintln!("[{kind:?}]");
                        println!("{data}");
                    }
                    Event::Created => eprintln!(
                        "[created] reference_id={} format={}",
                        sub.reference_id().unwrap_or_default(),
                        sub.format()
                    ),
                    Event::Error(err) => {
                        eprintln!(
                            "[error] status={} code={}",
                            err.status,
                            err.error_code().unwrap_or("-")
                        );
                        break;
                    }
                    Event::NetworkError => eprintln!("[network error] retrying"),
                    Event::ReadyToRemove => break,
                    Event::QueueEmpty => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if !line.trim().is_empty() => {
                        let msg: serde_json::Value = serde_json::from_str(&line)?;
                        let reference_id = msg["ReferenceId"].as_str().unwrap_or_default();
                        let data = msg.get("Data").cloned().unwrap_or_default();
                        let outcome = sub.on_streaming_data(StreamingMessage::new(reference_id, data));
                        eprintln!("[push] {outcome:?}");
                    }
                    Some(_) => {}
                    None => stdin_open = false,
                }
            }
            _ = orphan_check.tick() => {
                if sub.time_till_orphaned(tokio::time::Instant::now()).is_some_and(|ms| ms <= 0) {
                    eprintln!("[orphaned] resetting");
                    sub.reset(false)?;
                }
            }
        }
    }

    Ok(())
}
