use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::{
    ChunkStore, DatasetDescriptor, HsdsConfig, LayoutPlanner, ObjectId, Selection,
    array::bytes_to_array,
    layout::{chunk_indices, num_chunks},
};

#[derive(Debug, Parser)]
#[clap(about = "Inspect object keys, chunk layouts and chunk data")]
pub struct HsdsCLI {
    /// YAML configuration file, defaults apply when missing
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the storage key of an object id
    Key(KeyCommand),
    /// Print the object id stored under a key
    Id(IdCommand),
    /// List the chunks a selection touches
    Chunks(ChunksCommand),
    /// Propose a chunk shape for a new dataset
    #[clap(name = "guess-chunk")]
    GuessChunk(GuessChunkCommand),
    /// Read a selection of a dataset as JSON rows
    Read(ReadCommand),
}

#[derive(Debug, Args)]
struct KeyCommand {
    id: String,
}

#[derive(Debug, Args)]
struct IdCommand {
    key: String,
}

#[derive(Debug, Args)]
struct ChunksCommand {
    #[arg(long, value_delimiter = ',')]
    shape: Vec<u64>,
    #[arg(long, value_delimiter = ',')]
    chunks: Vec<u64>,
    /// Selection as `[start:stop:step, ...]`, the whole dataset by default
    #[arg(long)]
    select: Option<String>,
    /// Print chunk ids of this dataset instead of coordinates
    #[arg(long)]
    dataset: Option<String>,
}

#[derive(Debug, Args)]
struct GuessChunkCommand {
    /// Dataset extents, zero for unlimited
    #[arg(long, value_delimiter = ',')]
    shape: Vec<u64>,
    #[arg(long, value_delimiter = ',')]
    max_shape: Option<Vec<u64>>,
    /// Bytes per element, variable length types when missing
    #[arg(long)]
    item_size: Option<usize>,
}

#[derive(Debug, Args)]
struct ReadCommand {
    /// JSON dataset descriptor
    dataset: PathBuf,
    #[arg(long)]
    select: Option<String>,
    #[arg(long)]
    bucket: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<HsdsConfig> {
    match path {
        Some(path) => HsdsConfig::from_yaml_file(path)
            .with_context(|| format!("❌ Failed to load config {}", path.display())),
        None => Ok(HsdsConfig::default()),
    }
}

fn parse_selection(expr: Option<&str>, shape: &[u64]) -> Result<Selection> {
    match expr {
        Some(expr) => {
            Selection::parse(expr, shape).with_context(|| format!("❌ Invalid selection {expr}"))
        }
        None => Ok(Selection::all(shape)),
    }
}

fn key(cmd: KeyCommand) -> Result<()> {
    let id: ObjectId = cmd.id.parse().context("❌ Invalid object id")?;
    println!("{}", id.key());
    Ok(())
}

fn id(cmd: IdCommand) -> Result<()> {
    let id = ObjectId::from_key(&cmd.key).context("❌ Invalid object key")?;
    println!("{id} ({})", id.collection());
    Ok(())
}

fn chunks(cmd: ChunksCommand) -> Result<()> {
    let selection = parse_selection(cmd.select.as_deref(), &cmd.shape)?;
    let dataset: Option<ObjectId> =
        cmd.dataset.as_deref().map(str::parse::<ObjectId>).transpose().context("❌ Invalid dataset id")?;
    for coord in chunk_indices(&selection, &cmd.chunks)? {
        match &dataset {
            Some(dataset) => println!("{}", ObjectId::chunk(dataset, coord)?),
            None => println!("{coord}"),
        }
    }
    println!("✅ {} chunks", num_chunks(&selection, &cmd.chunks)?);
    Ok(())
}

fn guess_chunk(cmd: GuessChunkCommand, config: &HsdsConfig) -> Result<()> {
    if let Some(max_shape) = &cmd.max_shape {
        if max_shape.len() != cmd.shape.len() {
            bail!("❌ --max-shape has {} dimensions, --shape has {}", max_shape.len(), cmd.shape.len());
        }
    }
    let planner = LayoutPlanner::new(config.layout.clone());
    let layout = planner.guess_chunk_shape(&cmd.shape, cmd.max_shape.as_deref(), cmd.item_size);
    println!("{layout:?}");
    Ok(())
}

async fn read(cmd: ReadCommand, config: &HsdsConfig) -> Result<()> {
    let file = std::fs::File::open(&cmd.dataset)
        .with_context(|| format!("❌ Failed to open {}", cmd.dataset.display()))?;
    let desc: DatasetDescriptor =
        serde_json::from_reader(file).context("❌ Invalid dataset descriptor")?;
    let Some(bucket) = cmd.bucket.or_else(|| config.chunk_store.default_bucket.clone()) else {
        bail!("❌ No bucket given and no default bucket configured");
    };
    let selection = parse_selection(cmd.select.as_deref(), &desc.shape)?;

    let store = ChunkStore::from_config(config).context("❌ Failed to create storage")?;
    let data = store
        .read_hyperslab(&desc, &bucket, &selection)
        .await
        .with_context(|| format!("❌ Failed to read dataset {}", desc.id))?;
    let values = bytes_to_array(&data, desc.dtype.clone(), selection.shape())?;
    for flat in 0..selection.num_elements() as usize {
        println!("{}", serde_json::to_string(&values.row(flat)?)?);
    }
    Ok(())
}

pub async fn run_cli(args: HsdsCLI) -> Result<()> {
    let result = match load_config(args.config.as_ref()) {
        Ok(config) => match args.cmd {
            Command::Key(cmd) => key(cmd),
            Command::Id(cmd) => id(cmd),
            Command::Chunks(cmd) => chunks(cmd),
            Command::GuessChunk(cmd) => guess_chunk(cmd, &config),
            Command::Read(cmd) => read(cmd, &config).await,
        },
        Err(err) => Err(err),
    };
    result.map_err(|e| {
        eprintln!("❌ CLI Error: {e:#}");

        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("   ↳ Caused by: {cause}");
            source = cause.source();
        }

        e
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = HsdsCLI::try_parse_from([
            "hsds", "chunks", "--shape", "100,80", "--chunks", "10,10", "--select", "[0:20, 5:15:2]",
        ])
        .unwrap();
        let Command::Chunks(cmd) = cli.cmd else { panic!("expected chunks command") };
        assert_eq!(cmd.shape, vec![100, 80]);
        assert_eq!(cmd.chunks, vec![10, 10]);
        assert!(chunks(cmd).is_ok());

        let cli = HsdsCLI::try_parse_from(["hsds", "guess-chunk", "--shape", "0,100", "--item-size", "8"])
            .unwrap();
        assert!(matches!(cli.cmd, Command::GuessChunk(GuessChunkCommand { item_size: Some(8), .. })));
        assert!(HsdsCLI::try_parse_from(["hsds", "frobnicate"]).is_err());

        let cli = HsdsCLI::try_parse_from([
            "hsds", "guess-chunk", "--shape", "10,10", "--max-shape", "10", "--item-size", "8",
        ])
        .unwrap();
        let Command::GuessChunk(cmd) = cli.cmd else { panic!("expected guess-chunk command") };
        assert!(guess_chunk(cmd, &HsdsConfig::default()).is_err());
    }

    #[test]
    fn test_key_round_trip_commands() {
        assert!(key(KeyCommand { id: "g-be5e2b34-7f5a-11e8-aa3f-0242ac120004".to_string() }).is_ok());
        assert!(key(KeyCommand { id: "nope".to_string() }).is_err());
        assert!(id(IdCommand { key: "not/a/key".to_string() }).is_err());
    }
}
