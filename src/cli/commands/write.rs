//! Write command implementation.

use anyhow::{Context, Result};
use clap::Args;
use futures::stream::{self, Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};

use crate::cli::output::MessageWriter;
use crate::models::{Catalog, DestinationConfig, Message, batch_size_from_env};
use crate::services::Destination;

/// Arguments for the write command.
#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Destination configuration file (JSON or TOML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Configured catalog (JSON)
    #[arg(long)]
    pub catalog: PathBuf,

    /// JSONL input file (use - or omit for stdin)
    #[arg(long, short = 'i')]
    pub input: Option<PathBuf>,

    /// Records buffered per stream before a load
    #[arg(long, short = 'b')]
    pub batch_size: Option<usize>,
}

/// Handle the write command.
pub async fn handle_write(args: WriteArgs) -> Result<()> {
    let config = DestinationConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let catalog = load_catalog(&args.catalog)?;
    let batch_size = args.batch_size.unwrap_or_else(batch_size_from_env);

    let destination = Destination::new(&config)?;
    let reader = open_input(args.input.as_deref()).await?;
    let failure = ReadFailure::default();
    let input = read_messages(BufReader::new(reader), failure.clone());
    let output = destination.write(catalog, input, batch_size)?;
    futures::pin_mut!(output);

    info!(
        module = config.module_name(),
        batch_size, "writing messages"
    );
    let mut writer = MessageWriter::stdout();
    while let Some(message) = output.next().await {
        let message = message.context("sync failed")?;
        writer.write(&message).await.context("failed to write output")?;
    }
    if let Some(e) = failure.take() {
        return Err(e).context("failed to read input");
    }

    info!(messages = writer.written(), "write finished");
    Ok(())
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse catalog {}", path.display()))
}

async fn open_input(path: Option<&Path>) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    match path {
        Some(p) if p != Path::new("-") => {
            let file = tokio::fs::File::open(p)
                .await
                .with_context(|| format!("failed to open input {}", p.display()))?;
            Ok(Box::new(file))
        }
        _ => Ok(Box::new(tokio::io::stdin())),
    }
}

/// First read error of the input, kept for the command to report once the
/// output has drained.
#[derive(Debug, Clone, Default)]
pub struct ReadFailure(Arc<Mutex<Option<io::Error>>>);

impl ReadFailure {
    fn set(&self, error: io::Error) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(error);
        }
    }

    pub fn take(&self) -> Option<io::Error> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Parse JSON Lines into messages. Blank, non UTF-8 and unparseable lines are
/// skipped; a read error ends the input and is recorded in `failure`.
pub fn read_messages<R>(reader: R, failure: ReadFailure) -> impl Stream<Item = Message>
where
    R: AsyncBufRead + Unpin,
{
    stream::unfold(
        (reader.split(b'\n'), 0usize, failure),
        |(mut lines, mut line_no, failure)| async move {
            loop {
                line_no += 1;
                match lines.next_segment().await {
                    Ok(Some(line)) if line.iter().all(u8::is_ascii_whitespace) => continue,
                    Ok(Some(line)) => match serde_json::from_slice::<Message>(&line) {
                        Ok(message) => return Some((message, (lines, line_no, failure))),
                        Err(e) => warn!(line = line_no, error = %e, "skipping unparseable input line"),
                    },
                    Ok(None) => return None,
                    Err(e) => {
                        error!(line = line_no, error = %e, "failed to read input");
                        failure.set(e);
                        return None;
                    }
                }
            }
        },
    )
}
