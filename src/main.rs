//! Tonewire command line front end

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use tonewire::{
    audio::WaveformCache,
    config::EngineConfig,
    detect::ToneConsumer,
    events::{event_channel, EventMessage},
    tones::{SourcePool, ToneRegistry},
    utils::setup_logging,
    Result,
};

#[derive(Parser)]
#[command(name = "tonewire")]
#[command(about = "In-band telephony tone generator and detector")]
#[command(version = tonewire::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a tone as raw 8 kHz 16-bit PCM on standard output
    Play {
        /// Tone name, alias or descriptor (e.g. busy, dtmf/5, dtmfstr/123, 425/330)
        name: String,

        /// Language prefix for the registry lookup
        #[arg(short, long, default_value = "")]
        language: String,

        /// Stop after this many milliseconds; 0 plays until the tone ends
        #[arg(short, long, default_value_t = 0)]
        duration: u64,
    },
    /// Detect tones in raw 8 kHz 16-bit PCM read from standard input
    Detect {
        /// Stream name selecting channel mode and detectors
        #[arg(short, long, default_value = "tone/mono/*")]
        stream: String,
    },
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_configuration(&cli)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;

    match cli.command {
        Commands::Play {
            name,
            language,
            duration,
        } => {
            // PCM goes to stdout, so logs must not
            tracing_subscriber::fmt()
                .compact()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
                .init();
            run_play(&config, &name, &language, duration).await
        }
        Commands::Detect { stream } => {
            setup_logging(&config.logging)?;
            run_detect(&config, &stream).await
        }
        Commands::ValidateConfig => {
            setup_logging(&config.logging)?;
            info!("Configuration is valid");
            Ok(())
        }
        Commands::GenerateConfig { output } => {
            let text = EngineConfig::default().to_toml()?;
            match output {
                Some(path) => std::fs::write(path, text)?,
                None => print!("{}", text),
            }
            Ok(())
        }
    }
}

fn load_configuration(cli: &Cli) -> Result<EngineConfig> {
    if let Some(path) = &cli.config {
        return EngineConfig::load_from_file(path);
    }
    match EngineConfig::load_from_env() {
        Ok(config) => Ok(config),
        Err(_) => Ok(EngineConfig::default()),
    }
}

fn build_pool(config: &EngineConfig) -> SourcePool {
    let registry = Arc::new(ToneRegistry::new(Arc::new(WaveformCache::new())));
    registry.set_default_lang(config.general.default_language.clone());
    registry.load(&config.tones);
    SourcePool::new(registry)
}

async fn run_play(config: &EngineConfig, name: &str, language: &str, duration: u64) -> Result<()> {
    let pool = build_pool(config);
    let mut request = name.to_string();
    let source = match pool.get_tone(&mut request, language) {
        Some(source) => source,
        None => {
            // not a registered name, try an ad-hoc descriptor
            let mut desc = name.to_string();
            match tonewire::tones::ToneSource::temporary(&mut desc, language, None, pool.registry())
            {
                Some(source) => {
                    source.startup();
                    source
                }
                None => {
                    return Err(tonewire::Error::invalid_state(format!(
                        "Cannot resolve tone '{}'",
                        name
                    )))
                }
            }
        }
    };
    info!("Playing '{}'", source.name());

    if duration > 0 {
        let source = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration)).await;
            source.stop();
        });
    }

    let mut rx = source.subscribe();
    let mut stdout = std::io::stdout().lock();
    loop {
        tokio::select! {
            received = tokio::time::timeout(Duration::from_millis(50), rx.recv()) => {
                match received {
                    Ok(Ok(frame)) => stdout.write_all(&frame.data)?,
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        info!("Output lagged, skipped {} frames", skipped);
                    }
                    Ok(Err(RecvError::Closed)) => break,
                    Err(_) => {
                        if !source.is_running() {
                            break;
                        }
                    }
                }
            }
            _ = signal::ctrl_c() => {
                source.stop();
                break;
            }
        }
    }
    stdout.flush()?;
    info!(
        "Played {} bytes at {} b/s",
        source.total_bytes(),
        source.current_byte_rate()
    );
    Ok(())
}

async fn run_detect(config: &EngineConfig, stream: &str) -> Result<()> {
    let (sink, mut events) = event_channel();
    let id = format!("tone/{}", uuid::Uuid::new_v4());
    let mut consumer = ToneConsumer::new(id, stream, sink);
    if let Some(divert) = &config.general.fax_divert {
        let setup = EventMessage::new("chan.attach").param("fax_divert", divert.clone());
        consumer.set_fax_divert(&setup);
    }

    let printer = tokio::spawn(async move {
        while let Some(msg) = events.recv().await {
            let params = msg
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k.dimmed(), v))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{} {}", msg.kind.green().bold(), params);
        }
    });

    // frames are delivered inline from the reading thread
    let feeder = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 320];
        loop {
            match stdin.read_exact(&mut buf) {
                Ok(()) => consumer.consume(&buf),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    });

    feeder
        .await
        .map_err(|e| tonewire::Error::internal(format!("Reader task failed: {}", e)))??;
    // consumer and its sink are gone, the printer drains and ends
    printer
        .await
        .map_err(|e| tonewire::Error::internal(format!("Printer task failed: {}", e)))?;
    Ok(())
}
