use std::env;
use std::path::PathBuf;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use parley_storage::{HealthReport, RecoveryAction, SqliteConversationStore, StorageError, StoreConfig};

#[derive(Debug, Clone)]
struct DoctorArgs {
    command: Command,
    config_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Health,
    Repair,
    Reset,
    Export,
    Import,
}

impl Command {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "health" => Some(Self::Health),
            "repair" => Some(Self::Repair),
            "reset" => Some(Self::Reset),
            "export" => Some(Self::Export),
            "import" => Some(Self::Import),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Repair => "repair",
            Self::Reset => "reset",
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}

#[derive(Debug, Snafu)]
enum DoctorError {
    #[snafu(display("missing required --command argument"))]
    MissingCommand { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown command '{raw}'"))]
    UnknownCommand { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing required --file argument for command '{command}'"))]
    MissingFilePath {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("store operation failed: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type DoctorResult<T> = Result<T, DoctorError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("doctor_ok=false");
        eprintln!("doctor_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> DoctorResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let mut config = StoreConfig::load(args.config_path.as_deref()).context(StoreSnafu {
        stage: "load-config",
    })?;
    if let Some(db_path) = args.db_path.clone() {
        config.database_path = db_path;
    }

    println!("command={}", args.command.name());
    println!("db_path={}", config.database_path.display());

    let store = SqliteConversationStore::open(config);
    run_and_close(&store, &args).await?;

    println!("doctor_ok=true");
    Ok(())
}

/// The store is closed whether or not the command succeeded.
async fn run_and_close(store: &SqliteConversationStore, args: &DoctorArgs) -> DoctorResult<()> {
    let outcome = execute(store, args).await;
    store.close().await;
    outcome
}

async fn execute(store: &SqliteConversationStore, args: &DoctorArgs) -> DoctorResult<()> {
    match args.command {
        Command::Health => print_health(&store.check_database_health().await),
        Command::Repair => {
            let action = store.repair_database().await.context(StoreSnafu {
                stage: "repair-database",
            })?;
            print_recovery_action(&action);
        }
        Command::Reset => {
            store.force_reset().await.context(StoreSnafu {
                stage: "force-reset",
            })?;
            println!("reset=done");
        }
        Command::Export => {
            let path = require_file_path(args, "export")?;
            let document = store.export_conversations().await.context(StoreSnafu {
                stage: "export-conversations",
            })?;
            std::fs::write(&path, document).context(FileIoSnafu {
                stage: "export-write-file",
                path: path.display().to_string(),
            })?;
            println!("export_path={}", path.display());
        }
        Command::Import => {
            let path = require_file_path(args, "import")?;
            let document = std::fs::read_to_string(&path).context(FileIoSnafu {
                stage: "import-read-file",
                path: path.display().to_string(),
            })?;
            let report = store
                .import_conversations(&document)
                .await
                .context(StoreSnafu {
                    stage: "import-conversations",
                })?;
            println!("imported_conversations={}", report.imported_conversations);
            println!("skipped_invalid={}", report.skipped_invalid);
            println!("skipped_duplicates={}", report.skipped_duplicates);
            println!("imported_folders={}", report.imported_folders);
            println!("skipped_folders={}", report.skipped_folders);
        }
    }

    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> DoctorResult<DoctorArgs> {
    let mut command = None;
    let mut config_path = None;
    let mut db_path = None;
    let mut file_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--command" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-command-value",
                    arg: "--command",
                })?;
                let parsed = Command::parse(&value).context(UnknownCommandSnafu {
                    stage: "parse-args-command",
                    raw: value,
                })?;
                command = Some(parsed);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(PathBuf::from(value));
            }
            "--file" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-file-value",
                    arg: "--file",
                })?;
                file_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(DoctorArgs {
        command: command.context(MissingCommandSnafu {
            stage: "parse-args-command-required",
        })?,
        config_path,
        db_path,
        file_path,
    })
}

fn require_file_path(args: &DoctorArgs, command: &'static str) -> DoctorResult<PathBuf> {
    args.file_path.clone().context(MissingFilePathSnafu {
        stage: "require-file-path",
        command,
    })
}

fn print_health(report: &HealthReport) {
    println!("status={:?}", report.status);
    match report.schema_version {
        Some(version) => println!("schema_version={version}"),
        None => println!("schema_version=unknown"),
    }
    println!("tables={}", report.tables.join(","));
    println!("missing_tables={}", report.missing_tables.join(","));
    println!("conversation_records={}", report.conversation_records);
    println!("active_conversations={}", report.active_conversations);
    println!("backup_conversations={}", report.backup_conversations);
    println!("folders={}", report.folders);
    println!("recovery_attempts={}", report.recovery_attempts);
    println!("save_in_flight={}", report.save_in_flight);
    if let Some(details) = report.details.as_deref() {
        println!("details={details}");
    }
}

fn print_recovery_action(action: &RecoveryAction) {
    match action {
        RecoveryAction::AlreadyHealthy => println!("recovery=already_healthy"),
        RecoveryAction::Repaired { created } => {
            println!("recovery=repaired");
            println!("created_tables={}", created.join(","));
        }
        RecoveryAction::Rebuilt {
            salvaged_conversations,
            salvaged_folders,
        } => {
            println!("recovery=rebuilt");
            println!("salvaged_conversations={salvaged_conversations}");
            println!("salvaged_folders={salvaged_folders}");
        }
    }
}
