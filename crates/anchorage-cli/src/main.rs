use anyhow::{Context, Result};
use clap::Parser;

use anchorage_store::Config;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "anchorage", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// URL of an external backing store (switches to external mode)
    #[arg(long, global = true)]
    url: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Bring the backing store up and keep it running
    ///
    /// In self-managed mode this reuses a running anchorage container or
    /// launches a new one on a free port, then waits until the store
    /// reports ready. In external mode it only waits for readiness.
    ///
    /// The command then blocks until Ctrl-C, watching the store with a
    /// background health probe, and shuts down cleanly: in-flight
    /// operations are drained and a managed container is stopped.
    Up,
    /// Probe the configured backing store
    Status,
    /// Stop the managed backing store container
    Down,
    /// List the embedding models anchorage knows about
    Models {
        /// Only show models producing vectors of this width
        #[arg(long)]
        width: Option<usize>,
    },
    /// Bind a collection to an embedding model and create it
    ///
    /// A collection is bound once. Binding it again to the same model and
    /// metric is a no-op; binding it to anything else fails. Use `rebind`
    /// to replace a binding deliberately.
    Bind {
        /// Collection name
        collection: String,
        /// Embedding model name
        #[arg(long)]
        model: Option<String>,
        /// Vector width; picks the canonical model for that width
        #[arg(long)]
        width: Option<usize>,
        /// Distance metric (cosine, dot, euclid, manhattan)
        #[arg(long)]
        distance: Option<String>,
    },
    /// Replace a collection's binding (existing vectors are not re-embedded)
    Rebind {
        /// Collection name
        collection: String,
        /// Embedding model name
        #[arg(long)]
        model: String,
        /// Distance metric (defaults to the configured default)
        #[arg(long)]
        distance: Option<String>,
    },
    /// Show the binding of a collection
    Binding {
        /// Collection name
        collection: String,
    },
    /// Show a collection's binding next to its shape in the store
    Info {
        /// Collection name
        collection: String,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a collection together with its binding
    Unbind {
        /// Collection name
        collection: String,
    },
    /// Embed and store one or more documents
    Store {
        /// Collection name
        collection: String,
        /// Document texts
        #[arg(required = true)]
        texts: Vec<String>,
        /// Metadata attached to every document, as JSON
        #[arg(long)]
        metadata: Option<String>,
        /// Embedding model for a first binding
        #[arg(long)]
        model: Option<String>,
        /// Vector width for a first binding
        #[arg(long)]
        width: Option<usize>,
    },
    /// Search a collection
    Find {
        /// Collection name
        collection: String,
        /// Query text
        query: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
        /// Drop results scoring worse than this
        #[arg(long)]
        min_score: Option<f32>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Page through the documents stored in a collection
    Scroll {
        /// Collection name
        collection: String,
        /// Documents per page
        #[arg(long)]
        limit: Option<usize>,
        /// Offset returned by the previous page
        #[arg(long)]
        offset: Option<String>,
        /// Print the page as JSON
        #[arg(long)]
        json: bool,
    },
    /// List collections
    Collections,
    /// Show which ports in the configured range are free
    Ports {
        /// First port to check (defaults to port_range_start)
        #[arg(long)]
        start: Option<u16>,
        /// Last port to check (defaults to port_range_end)
        #[arg(long)]
        end: Option<u16>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print one value, or the whole config file
    Get {
        /// Config key
        key: Option<String>,
    },
    /// Set a value in the config file
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
    /// Print the config file path
    Path,
    /// Print an example config file
    Example,
    /// Create the config file with defaults
    Init,
}

fn load_config(url: Option<String>) -> Result<Config> {
    match url {
        Some(url) => Config::load_with_url(url),
        None => Config::load(),
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => commands::config::show_config(),
        ConfigAction::Get { key } => commands::config::get_config(key),
        ConfigAction::Set { key, value } => commands::config::set_config(&key, &value),
        ConfigAction::Path => commands::config::show_path(),
        ConfigAction::Example => commands::config::show_example(),
        ConfigAction::Init => commands::config::init_config(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config commands must work even when the file is broken.
    let command = match cli.command {
        Commands::Config { action } => return run_config(action),
        other => other,
    };

    let config = load_config(cli.url).context("Failed to load configuration")?;
    if let Err(e) = twyg::setup(config.logging.clone()) {
        anyhow::bail!("Failed to set up logging: {e:?}");
    }
    log::info!("Loaded configuration ({} mode)", config.mode);

    match command {
        Commands::Up => commands::lifecycle::run_up(&config).await?,
        Commands::Status => commands::lifecycle::show_status(&config).await?,
        Commands::Down => commands::lifecycle::run_down(&config).await?,
        Commands::Models { width } => commands::bindings::list_models(width),
        Commands::Bind {
            collection,
            model,
            width,
            distance,
        } => {
            commands::bindings::bind(&config, &collection, model, width, distance).await?;
        }
        Commands::Rebind {
            collection,
            model,
            distance,
        } => commands::bindings::rebind(&config, &collection, &model, distance).await?,
        Commands::Binding { collection } => {
            commands::bindings::show_binding(&config, &collection).await?;
        }
        Commands::Info { collection, json } => {
            commands::bindings::show_info(&config, &collection, json).await?;
        }
        Commands::Unbind { collection } => {
            commands::bindings::unbind(&config, &collection).await?;
        }
        Commands::Store {
            collection,
            texts,
            metadata,
            model,
            width,
        } => {
            commands::documents::store(&config, &collection, texts, metadata, model, width)
                .await?;
        }
        Commands::Find {
            collection,
            query,
            limit,
            min_score,
            json,
        } => {
            commands::documents::find(&config, &collection, &query, limit, min_score, json)
                .await?;
        }
        Commands::Scroll {
            collection,
            limit,
            offset,
            json,
        } => {
            commands::documents::scroll(&config, &collection, limit, offset.as_deref(), json)
                .await?;
        }
        Commands::Collections => commands::documents::list_collections(&config).await?,
        Commands::Ports { start, end } => commands::ports::show_ports(&config, start, end)?,
        Commands::Config { action } => run_config(action)?,
    }

    Ok(())
}
