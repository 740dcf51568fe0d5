use clap::{Parser, Subcommand, ValueEnum};
use loomdb::automation::{AutomationEngine, AutomationEvent, AutomationRule, TriggerType};
use loomdb::query::{FilterOp, QuerySpec, SortSpec};
use loomdb::scheduler::Scheduler;
use loomdb::schema::parse_tables;
use loomdb::search::SearchOptions;
use loomdb::system_db::{now, parse_timestamp};
use loomdb::{LoomConfig, RelationType, Store};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tokio::sync::{mpsc, watch};

/// loomdb CLI: runtime-defined tables, search, links and automations
#[derive(Parser)]
#[command(name = "loomdb", version, about)]
struct Cli {
    /// SQLite database file (overrides config and LOOMDB_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create every table declared in a YAML file
    CreateTable {
        /// YAML file with a `tables:` list or a single table
        file: PathBuf,
    },

    /// List table definitions
    Tables,

    /// Insert a record
    Insert {
        table: String,
        /// Field values (e.g. --field title="Ship it")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Get a single record by ID
    Get {
        table: String,
        id: String,
        #[arg(long)]
        include_deleted: bool,
    },

    /// Merge field values into a record
    Update {
        table: String,
        id: String,
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record (soft delete when the table supports it)
    Delete { table: String, id: String },

    /// Undo a soft delete
    Restore { table: String, id: String },

    /// Query records
    Query {
        table: String,
        #[command(flatten)]
        spec: QueryArgs,
    },

    /// Count records matching a query
    Count {
        table: String,
        #[command(flatten)]
        spec: QueryArgs,
    },

    /// Full-text search over searchable fields
    Search {
        table: String,
        text: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Link two records
    Link {
        from_table: String,
        from_id: String,
        to_table: String,
        to_id: String,
        #[arg(long, default_value = "related_to")]
        relation: String,
    },

    /// Show the knowledge graph around a record
    Graph {
        table: String,
        id: String,
        #[arg(long, default_value_t = 1)]
        depth: usize,
    },

    /// Create an automation rule from a YAML file
    AddRule { file: PathBuf },

    /// List automation rules
    Rules {
        /// Only rules of this table (id or slug)
        #[arg(long)]
        module: Option<String>,
    },

    /// List executions of a rule
    Executions { rule_id: String },

    /// Raise a custom automation event
    Raise {
        name: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Table the event belongs to (id or slug)
        #[arg(long)]
        module: Option<String>,
    },

    /// Run one scheduler tick covering the window since `--since`
    Tick {
        /// RFC 3339 start of the window
        #[arg(long)]
        since: String,
    },

    /// Read the mutation log
    Mutations {
        #[arg(long, default_value_t = 0)]
        since: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Run the automation engine and scheduler until Ctrl-C
    Serve,
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Named view of the table
    #[arg(long)]
    view: Option<String>,
    /// Filters: field=value, field~value, field>value or field<value
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, FilterOp, String)>,
    /// Sort expression (e.g. -priority)
    #[arg(long)]
    sort: Option<String>,
    #[arg(long, default_value_t = 0)]
    skip: u32,
    #[arg(long)]
    take: Option<u32>,
    #[arg(long)]
    include_deleted: bool,
}

impl QueryArgs {
    fn to_spec(&self) -> Result<QuerySpec, Box<dyn std::error::Error>> {
        let mut spec = QuerySpec::new().skip(self.skip);
        if let Some(view) = &self.view {
            spec = spec.view(view);
        }
        for (field, op, value) in &self.filters {
            spec = spec.filter(field, *op, parse_value(value));
        }
        if let Some(sort) = &self.sort {
            spec.sort = Some(SortSpec::parse(sort)?);
        }
        if let Some(take) = self.take {
            spec = spec.take(take);
        }
        if self.include_deleted {
            spec = spec.include_deleted();
        }
        Ok(spec)
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_filter(s: &str) -> Result<(String, FilterOp, String), String> {
    let pos = s
        .find(['=', '~', '>', '<'])
        .ok_or_else(|| format!("Invalid filter '{s}': expected one of = ~ > <"))?;
    let op = match &s[pos..pos + 1] {
        "=" => FilterOp::Equals,
        "~" => FilterOp::Contains,
        ">" => FilterOp::GreaterThan,
        _ => FilterOp::LessThan,
    };
    Ok((s[..pos].to_string(), op, s[pos + 1..].to_string()))
}

/// JSON when it parses (numbers, booleans, lists), else a plain string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let map = fields
        .iter()
        .map(|(key, val)| (key.clone(), parse_value(val)))
        .collect();
    serde_json::Value::Object(map)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<LoomConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => LoomConfig::load(path)?,
        None => {
            let mut config = LoomConfig::default();
            config.apply_env()?;
            config
        }
    };
    if let Some(db) = &cli.db {
        config.database = Some(db.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = Store::open(config.clone())?.with_events(tx);
    let engine = AutomationEngine::new(store.clone());
    let format = cli.format;

    match cli.command {
        Command::CreateTable { file } => {
            let mut created = Vec::new();
            for table in parse_tables(&file)? {
                created.push(store.create_table(table).await?);
            }
            print_output(&created, &format)?;
        }

        Command::Tables => {
            print_output(&store.list_tables().await?, &format)?;
        }

        Command::Insert { table, fields } => {
            let record = store.insert(&table, fields_to_value(&fields)).await?;
            print_output(&record, &format)?;
        }

        Command::Get {
            table,
            id,
            include_deleted,
        } => {
            print_output(&store.get(&table, &id, include_deleted).await?, &format)?;
        }

        Command::Update { table, id, fields } => {
            let record = store.update(&table, &id, fields_to_value(&fields)).await?;
            print_output(&record, &format)?;
        }

        Command::Delete { table, id } => {
            let record = store.delete(&table, &id).await?;
            print_output(&serde_json::json!({ "ok": true, "deleted": record.id }), &format)?;
        }

        Command::Restore { table, id } => {
            print_output(&store.restore(&table, &id).await?, &format)?;
        }

        Command::Query { table, spec } => {
            print_output(&store.query(&table, &spec.to_spec()?).await?, &format)?;
        }

        Command::Count { table, spec } => {
            let count = store.count(&table, &spec.to_spec()?).await?;
            print_output(&serde_json::json!({ "count": count }), &format)?;
        }

        Command::Search {
            table,
            text,
            limit,
            offset,
        } => {
            let options = SearchOptions {
                limit,
                offset,
                ..SearchOptions::default()
            };
            print_output(&store.search(&table, &text, &options).await?, &format)?;
        }

        Command::Link {
            from_table,
            from_id,
            to_table,
            to_id,
            relation,
        } => {
            let edge = store
                .link_records(&from_table, &from_id, &to_table, &to_id, RelationType::parse(&relation))
                .await?;
            print_output(&edge, &format)?;
        }

        Command::Graph { table, id, depth } => {
            print_output(&store.get_graph(&table, &id, depth).await?, &format)?;
        }

        Command::AddRule { file } => {
            let content = std::fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read rule file '{}': {e}", file.display()))?;
            let rule: AutomationRule = serde_yaml::from_str(&content)?;
            print_output(&engine.create_rule(rule).await?, &format)?;
        }

        Command::Rules { module } => {
            print_output(&engine.list_rules(module.as_deref()).await?, &format)?;
        }

        Command::Executions { rule_id } => {
            print_output(&engine.list_executions(&rule_id).await?, &format)?;
        }

        Command::Raise {
            name,
            payload,
            module,
        } => {
            let mut event = AutomationEvent::new(name, TriggerType::Event, serde_json::from_str(&payload)?);
            if let Some(module) = module {
                event = event.with_module(store.get_table(&module).await?.id);
            }
            print_output(&engine.raise(event).await?, &format)?;
        }

        Command::Tick { since } => {
            let mut scheduler =
                Scheduler::new(engine.clone(), config.scheduler.clone()).starting_at(parse_timestamp(&since)?);
            print_output(&scheduler.tick(now()).await?, &format)?;
        }

        Command::Mutations { since, limit } => {
            print_output(&store.mutations_since(since, limit).await?, &format)?;
        }

        Command::Serve => {
            let (stop_tx, stop_rx) = watch::channel(false);
            let scheduler = Scheduler::new(engine.clone(), config.scheduler.clone());
            let scheduler_task = tokio::spawn(scheduler.run(stop_rx.clone()));
            let worker = engine.clone();
            let engine_task = tokio::spawn(async move { worker.run(rx, stop_rx).await });

            tokio::signal::ctrl_c().await?;
            log::info!("Shutting down");
            stop_tx.send(true)?;
            scheduler_task.await?;
            engine_task.await?;
            return Ok(());
        }
    }

    // Mutations above queued events; run their automations before exiting.
    let executions = engine.drain(&mut rx).await?;
    if !executions.is_empty() {
        log::info!("Ran {} automation execution(s)", executions.len());
    }
    Ok(())
}

fn print_output<T: Serialize>(value: &T, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
