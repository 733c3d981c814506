use clap::{Args, Parser, Subcommand, ValueEnum};
use doclite::{Config, Constraint, Database, Direction, Query, QuerySource, WhereOp};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;

/// doclite CLI: read and write a doclite store from the command line
#[derive(Parser)]
#[command(name = "doclite", version, about)]
struct Cli {
    /// YAML config file; --data-dir and --name override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the store (default: current directory)
    #[arg(long, env = "DOCLITE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Store file name
    #[arg(long, env = "DOCLITE_NAME")]
    name: Option<String>,

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
    /// Get a single document (e.g. users/alice)
    Get {
        /// Document path
        path: String,
    },

    /// Create or replace a document
    Set {
        /// Document path
        path: String,
        #[command(flatten)]
        data: DataArgs,
    },

    /// Merge fields into an existing document
    Update {
        /// Document path
        path: String,
        #[command(flatten)]
        data: DataArgs,
    },

    /// Apply a JSON Patch (RFC 6902 operations array) to a document
    Patch {
        /// Document path
        path: String,
        /// Patch operations as JSON
        ops: String,
    },

    /// Delete a document
    Delete {
        /// Document path
        path: String,
    },

    /// Add a document with a generated id
    Add {
        /// Collection path
        collection: String,
        #[command(flatten)]
        data: DataArgs,
    },

    /// Query a collection or collection group
    Query(QueryArgs),

    /// Count the documents a query matches
    Count(QueryArgs),

    /// Print query results every time they change, until interrupted
    Watch(QueryArgs),

    /// Create an index on a field of a collection
    Index {
        /// Collection path
        collection: String,
        /// Field path (dotted for nested fields)
        field: String,
    },

    /// Export the whole store
    Export {
        /// Raw database image instead of JSON rows
        #[arg(long, requires = "output")]
        binary: bool,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Replace the whole store with a backup
    Import {
        /// Backup file
        file: PathBuf,
        /// The file is a raw database image
        #[arg(long)]
        binary: bool,
    },

    /// Stored binary files
    File {
        #[command(subcommand)]
        command: FileCommand,
    },
}

#[derive(Subcommand)]
enum FileCommand {
    /// Upload a local file
    Put {
        /// Storage path
        path: String,
        /// Local file to upload
        source: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },
    /// Show a stored file's metadata, or save its content with --output
    Get {
        /// Storage path
        path: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete a stored file
    Rm {
        /// Storage path
        path: String,
    },
}

#[derive(Args)]
struct DataArgs {
    /// Field values (e.g. --field name="Alice Chen" --field address.city=Lisbon)
    #[arg(long = "field", value_parser = parse_key_value)]
    fields: Vec<(String, String)>,
    /// Whole document as a JSON object; --field values are applied on top
    #[arg(long)]
    json: Option<String>,
}

#[derive(Args)]
struct QueryArgs {
    /// Collection path, or collection id with --group
    collection: String,
    /// Query every collection with this id, at any depth
    #[arg(long)]
    group: bool,
    /// Filter as "field op value" (e.g. --where "age >= 18")
    #[arg(long = "where", value_parser = parse_where)]
    filters: Vec<Constraint>,
    /// Sort key as field or field:desc
    #[arg(long = "order-by", value_parser = parse_order_by)]
    order: Vec<Constraint>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    limit_to_last: Option<u64>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_where(s: &str) -> Result<Constraint, String> {
    let mut parts = s.trim().splitn(3, char::is_whitespace);
    let (Some(field), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("Invalid filter '{s}': expected \"field op value\""));
    };
    let op: WhereOp = op.parse()?;
    Ok(doclite::where_field(field, op, parse_scalar(value.trim())))
}

fn parse_order_by(s: &str) -> Result<Constraint, String> {
    let (field, direction) = match s.rsplit_once(':') {
        Some((field, direction)) => (field, direction.parse::<Direction>()?),
        None => (s, Direction::Asc),
    };
    Ok(doclite::order_by(field, direction))
}

/// JSON when it parses (numbers, booleans, arrays, objects), else a string.
fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    log::debug!("Using store {}", config.db_path().display());
    let db = Database::open(config).await?;
    let format = cli.format;

    match cli.command {
        Command::Get { path } => {
            let snapshot = db.get_doc(&db.doc(&path)?).await?;
            print_output(
                &json!({
                    "path": snapshot.reference().path(),
                    "exists": snapshot.exists(),
                    "data": snapshot.data(),
                }),
                &format,
            )?;
        }

        Command::Set { path, data } => {
            let reference = db.doc(&path)?;
            db.set_doc(&reference, data.to_value()?).await?;
            print_output(&json!({ "ok": true, "path": reference.path() }), &format)?;
        }

        Command::Update { path, data } => {
            let reference = db.doc(&path)?;
            db.update_doc(&reference, data.to_value()?).await?;
            print_output(&json!({ "ok": true, "path": reference.path() }), &format)?;
        }

        Command::Patch { path, ops } => {
            let reference = db.doc(&path)?;
            let ops: Value = serde_json::from_str(&ops)?;
            db.update_doc_patch(reference.collection_id(), reference.id(), ops)
                .await?;
            print_output(&json!({ "ok": true, "path": reference.path() }), &format)?;
        }

        Command::Delete { path } => {
            let reference = db.doc(&path)?;
            db.delete_doc(&reference).await?;
            print_output(&json!({ "ok": true, "deleted": reference.path() }), &format)?;
        }

        Command::Add { collection, data } => {
            let collection = db.collection(&collection)?;
            let reference = db.add_doc(&collection, data.to_value()?).await?;
            print_output(
                &json!({ "id": reference.id(), "path": reference.path() }),
                &format,
            )?;
        }

        Command::Query(args) => {
            let snapshot = db.get_docs(&args.to_query(&db)?).await?;
            print_output(&serde_json::to_value(snapshot.docs())?, &format)?;
        }

        Command::Count(args) => {
            let count = db.count(&args.to_query(&db)?).await?;
            print_output(&json!({ "count": count }), &format)?;
        }

        Command::Watch(args) => {
            let registration = db
                .on_query_snapshot(&args.to_query(&db)?, move |snapshot, changes| {
                    let changes: Vec<Value> = changes
                        .iter()
                        .map(|change| {
                            json!({
                                "kind": format!("{:?}", change.kind).to_lowercase(),
                                "path": format!("{}/{}", change.doc.collection_id, change.doc.id),
                                "old_index": change.old_index,
                                "new_index": change.new_index,
                            })
                        })
                        .collect();
                    let event = json!({ "size": snapshot.size(), "changes": changes });
                    if let Err(e) = print_output(&event, &format) {
                        log::error!("Failed to print change: {e}");
                    }
                })
                .await?;
            tokio::signal::ctrl_c().await?;
            registration.unsubscribe();
        }

        Command::Index { collection, field } => {
            let name = db.create_index(&collection, &field).await?;
            print_output(&json!({ "ok": true, "index": name }), &format)?;
        }

        Command::Export { binary, output } => {
            if binary {
                let image = db.export_binary().await?;
                // --binary requires --output.
                if let Some(path) = output {
                    std::fs::write(&path, &image)?;
                    print_output(
                        &json!({ "ok": true, "bytes": image.len(), "output": path }),
                        &format,
                    )?;
                }
            } else {
                let rows = serde_json::to_value(db.export_json().await?)?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, serde_json::to_string_pretty(&rows)?)?;
                        print_output(&json!({ "ok": true, "output": path }), &format)?;
                    }
                    None => print_output(&rows, &format)?,
                }
            }
        }

        Command::Import { file, binary } => {
            let bytes = std::fs::read(&file)
                .map_err(|e| format!("Failed to read backup '{}': {e}", file.display()))?;
            if binary {
                db.import_binary(bytes).await?;
                print_output(&json!({ "ok": true }), &format)?;
            } else {
                let backup: Value = serde_json::from_slice(&bytes)?;
                let count = db.import_json(&backup).await?;
                print_output(&json!({ "ok": true, "documents": count }), &format)?;
            }
        }

        Command::File { command } => match command {
            FileCommand::Put {
                path,
                source,
                content_type,
            } => {
                let data = std::fs::read(&source)
                    .map_err(|e| format!("Failed to read '{}': {e}", source.display()))?;
                db.upload_file(&path, data, &content_type).await?;
                print_output(&json!({ "ok": true, "path": path }), &format)?;
            }
            FileCommand::Get { path, output } => {
                let file = db
                    .get_file(&path)
                    .await?
                    .ok_or_else(|| format!("File not found: {path}"))?;
                if let Some(output) = output {
                    std::fs::write(&output, &file.data)?;
                }
                print_output(&serde_json::to_value(&file)?, &format)?;
            }
            FileCommand::Rm { path } => {
                db.delete_file(&path).await?;
                print_output(&json!({ "ok": true, "deleted": path }), &format)?;
            }
        },
    }

    db.close().await?;
    Ok(())
}

impl DataArgs {
    fn to_value(&self) -> Result<Value, Box<dyn std::error::Error>> {
        let mut map = match &self.json {
            Some(raw) => match serde_json::from_str(raw)? {
                Value::Object(map) => map,
                _ => return Err("--json must be a JSON object".into()),
            },
            None => serde_json::Map::new(),
        };
        for (key, val) in &self.fields {
            map.insert(key.clone(), parse_scalar(val));
        }
        Ok(Value::Object(map))
    }
}

impl QueryArgs {
    fn to_query(&self, db: &Database) -> Result<Query, Box<dyn std::error::Error>> {
        let source = if self.group {
            QuerySource::CollectionGroup(db.collection_group(&self.collection)?)
        } else {
            QuerySource::Collection(db.collection(&self.collection)?)
        };
        let mut constraints = self.filters.clone();
        constraints.extend(self.order.iter().cloned());
        if let Some(n) = self.limit {
            constraints.push(doclite::limit(n));
        }
        if let Some(n) = self.limit_to_last {
            constraints.push(doclite::limit_to_last(n));
        }
        Ok(Query::new(source, constraints))
    }
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
