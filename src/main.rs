use std::error::Error;
use std::io::{ self, BufRead, Write };
use std::time::Duration;

use clap::{ Parser, Subcommand };
use log::{ info, error };

use grounded_search::chat::{ Assistant, AzureOpenAiChat, Conversation };
use grounded_search::{ create_search_service, provision, run_indexer_and_wait, PipelineConfig, QueryExecutor };

#[derive(Parser)]
#[command(name = "grounded-search", version, about = "Provision and query a hybrid search index")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upsert data source, index, skillset and indexer
    Provision {
        /// Wait for the first indexer run to finish
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Run a hybrid query and print the hits as JSON
    Search { query: String },
    /// Start an indexer run now
    RunIndexer,
    /// Show the latest indexer run
    Status,
    /// Count documents in the index
    Count,
    /// Answer questions read line by line from stdin
    Chat,
}

fn init_logging() {
    use tracing_subscriber::{ fmt, EnvFilter };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).with_writer(io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    init_logging();
    let cli = Cli::parse();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    let service = create_search_service(&config)?;
    let names = &config.names;

    match cli.command {
        Commands::Provision { wait, timeout_secs } => {
            let pipeline = provision(service.as_ref(), &config).await?;
            if wait {
                let state = pipeline.wait_until_indexed(
                    service.as_ref(),
                    Duration::from_secs(5),
                    Duration::from_secs(timeout_secs)
                ).await?;
                println!("{:?}", state);
            }
        }
        Commands::Search { query } => {
            let executor = QueryExecutor::with_options(service, &names.index, config.query_options());
            let hits = executor.search(&query).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Commands::RunIndexer => {
            let state = run_indexer_and_wait(
                service.as_ref(),
                &names.indexer,
                config.indexing.max_failed_items,
                Duration::from_secs(5),
                Duration::from_secs(600)
            ).await?;
            println!("{:?}", state);
        }
        Commands::Status => {
            let status = service.indexer_status(&names.indexer).await?;
            println!("{:?}", status.run_state(config.indexing.max_failed_items));
            if let Some(last) = status.last_result {
                println!("{}", serde_json::to_string_pretty(&last)?);
            }
        }
        Commands::Count => {
            println!("{}", service.count_documents(&names.index).await?);
        }
        Commands::Chat => {
            let model = AzureOpenAiChat::new(&config.chat()?)?;
            let executor = QueryExecutor::with_options(service, &names.index, config.query_options());
            let assistant = Assistant::new(executor, model);
            let mut conversation = Conversation::new();

            info!("Chat ready; one question per line, end with EOF");
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let question = line.trim();
                if question.is_empty() {
                    continue;
                }
                let (next, reply) = assistant.respond(conversation, question).await?;
                conversation = next;
                let mut out = io::stdout().lock();
                writeln!(out, "{}\n", reply)?;
                out.flush()?;
            }
        }
    }

    Ok(())
}
