use std::error::Error;

use resumable_stream::{ConnectionState, EventKind, StreamTransport, TransportConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_url =
        std::env::var("STREAM_BASE_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.is_empty() {
        "Summarize the latest status report.".to_string()
    } else {
        prompt
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let transport = StreamTransport::new(TransportConfig::new(base_url))?;

        let _messages = transport.on_message(|event| match &event.kind {
            EventKind::Answer => println!("answer {}", event.payload),
            EventKind::Thought => println!("thought {}", event.payload),
            kind => println!("{kind} id={}", event.id.as_deref().unwrap_or("-")),
        });
        let _errors = transport.on_error(|error| {
            eprintln!("stream error ({:?}): {error}", error.kind());
        });

        let mut state = transport.watch_state();
        transport.send(prompt);

        let finished = *state
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::ClosedClean | ConnectionState::ClosedError
                )
            })
            .await?;
        println!(
            "finished state={finished:?} conversation_id={}",
            transport.conversation_id().unwrap_or_default()
        );

        Ok::<(), Box<dyn Error>>(())
    })
}
