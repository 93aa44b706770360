use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use numseq::{
    CounterStore, FieldMap, FileCounterStore, NumberGenerator, SequenceConfig, SequenceField,
    resolve_segment_value, tokenize,
};

const DEFAULT_STORE: &str = "numseq-counters.json";

#[derive(Debug, Parser)]
#[command(name = "numseq", version, about = "Pattern-based sequential number generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate the next number(s) for a sequence configuration.
    Next {
        /// JSON file holding one sequence configuration.
        #[arg(long)]
        config: PathBuf,
        #[arg(long, env = "NUMSEQ_STORE", default_value = DEFAULT_STORE)]
        store: PathBuf,
        /// Record field used by segment placeholders, as NAME=VALUE.
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        json: bool,
    },
    /// Fill the numbered fields of JSON records and print them.
    Assign {
        /// JSON file holding one numbered field or an array of them.
        #[arg(long)]
        config: PathBuf,
        /// JSON file holding one record object or an array of them.
        #[arg(long)]
        record: PathBuf,
        #[arg(long, env = "NUMSEQ_STORE", default_value = DEFAULT_STORE)]
        store: PathBuf,
    },
    /// Show how a pattern splits into tokens.
    Tokenize {
        pattern: String,
        #[arg(long)]
        json: bool,
    },
    /// Render a pattern for a given counter value without touching a store.
    Render {
        pattern: String,
        #[arg(long)]
        value: i64,
    },
    /// List persisted counters.
    Show {
        #[arg(long, env = "NUMSEQ_STORE", default_value = DEFAULT_STORE)]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_store(path: &Path) -> Result<FileCounterStore, String> {
    FileCounterStore::open(path).map_err(|e| e.to_string())
}

fn run_next(
    config: &Path,
    store: &Path,
    fields: &[(String, String)],
    count: usize,
    json_out: bool,
) -> Result<(), String> {
    let config = SequenceConfig::load(config).map_err(|e| e.to_string())?;
    let store = open_store(store)?;
    let record = fields
        .iter()
        .fold(FieldMap::new(), |rec, (name, value)| rec.with(name.as_str(), value.as_str()));

    let generator = NumberGenerator::default();
    let segment = resolve_segment_value(&record, &config).map_err(|e| e.to_string())?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let value = generator
            .generate_for_segment(&config, segment.as_deref(), &store)
            .map_err(|e| e.to_string())?;
        if !json_out {
            println!("{}", value);
        }
        values.push(value);
    }

    if json_out {
        let payload = json!({
            "key": config.key,
            "segment": segment,
            "values": values,
        });
        println!("{}", serde_json::to_string(&payload).map_err(|e| e.to_string())?);
    }
    Ok(())
}

fn run_assign(config: &Path, record: &Path, store: &Path) -> Result<(), String> {
    let data = fs::read_to_string(config).map_err(|e| e.to_string())?;
    let fields = SequenceField::list_from_json(&data).map_err(|e| e.to_string())?;

    let data = fs::read_to_string(record).map_err(|e| e.to_string())?;
    let input: Value = serde_json::from_str(&data).map_err(|e| e.to_string())?;
    let (mut records, single) = match input {
        Value::Array(items) => (items, false),
        other => (vec![other], true),
    };

    let store = open_store(store)?;
    let generator = NumberGenerator::default();
    let mut batch = generator.batch(&store);
    for item in records.iter_mut() {
        let Value::Object(map) = item else {
            return Err("records must be JSON objects".to_string());
        };
        let map: &mut Map<String, Value> = map;
        batch.assign(map, &fields).map_err(|e| e.to_string())?;
    }
    batch.commit().map_err(|e| e.to_string())?;

    let output = if single {
        records.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(records)
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn run_tokenize(pattern: &str, json_out: bool) -> Result<(), String> {
    let generator = NumberGenerator::default();
    let tokens = tokenize(pattern, generator.now());

    if json_out {
        let payload: Vec<Value> = tokens
            .iter()
            .map(|t| {
                json!({
                    "identifier": t.identifier,
                    "parameters": t.parameters,
                    "source": t.source,
                    "handled": generator.registry().handler_for(t).is_some(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string(&payload).map_err(|e| e.to_string())?);
    } else {
        for t in &tokens {
            let handled = generator.registry().handler_for(t).is_some();
            println!(
                "{}\tid={} params=[{}]{}",
                t.source,
                t.identifier,
                t.parameters.join(","),
                if handled { "" } else { " (verbatim)" }
            );
        }
    }
    Ok(())
}

fn run_render(pattern: &str, value: i64) -> Result<(), String> {
    let generator = NumberGenerator::default();
    println!("{}", generator.preview(pattern, value));
    Ok(())
}

fn run_show(store: &Path, json_out: bool) -> Result<(), String> {
    let store = open_store(store)?;
    let records = store.records().map_err(|e| e.to_string())?;

    if json_out {
        println!("{}", serde_json::to_string(&records).map_err(|e| e.to_string())?);
    } else {
        for r in &records {
            println!(
                "{}\t{}\t{}\t{}\t{}",
                r.key,
                r.segment.as_deref().unwrap_or("-"),
                r.current_value,
                r.pattern,
                r.last_advanced_at.to_rfc3339()
            );
        }
    }
    Ok(())
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let res = match &cli.command {
        Command::Next {
            config,
            store,
            fields,
            count,
            json,
        } => run_next(config, store, fields, *count, *json),
        Command::Assign {
            config,
            record,
            store,
        } => run_assign(config, record, store),
        Command::Tokenize { pattern, json } => run_tokenize(pattern, *json),
        Command::Render { pattern, value } => run_render(pattern, *value),
        Command::Show { store, json } => run_show(store, *json),
    };

    if let Err(err) = res {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}
