//! Espejo CLI - rsync-style tree synchronization.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use espejo::{
    block_size_for, generate_delta, summarize_with_block_size, CancelToken, DeltaEvent, FileInfo,
    FilePatcher, FsStore, Namespace, PatchEncoder, StoreSink, SyncParams, SyncService,
};

/// Espejo - synchronize a local tree against a path store
#[derive(Parser)]
#[command(name = "espejo")]
#[command(version)]
#[command(about = "rsync-style tree synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize a local directory into a local store
    Sync {
        /// Source directory
        #[arg(required = true)]
        source: PathBuf,

        /// Base directory of the path store
        #[arg(required = true)]
        store: PathBuf,

        /// Account namespace
        #[arg(long, default_value = "local")]
        account: String,

        /// Project namespace
        #[arg(long, default_value = "default")]
        project: String,

        /// Max number of files being uploaded or patched in parallel
        #[arg(long, default_value = "8")]
        max_parallel_file_streams: usize,
    },

    /// Print the block summary of a file
    Sum {
        /// File to summarize
        #[arg(required = true)]
        file: PathBuf,

        /// Block size (derived from the file size if omitted)
        #[arg(short, long)]
        block_size: Option<u32>,
    },

    /// Compute a patch from a source file against a sink file
    Delta {
        /// Source file (new version)
        #[arg(required = true)]
        source: PathBuf,

        /// Sink file (old version)
        #[arg(required = true)]
        sink: PathBuf,

        /// Output patch file (default: <source>.patch)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Apply a patch to a sink file
    Patch {
        /// Sink file (old version)
        #[arg(required = true)]
        sink: PathBuf,

        /// Patch file
        #[arg(required = true)]
        patch: PathBuf,

        /// Output file (default: <sink>.patched)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Sync {
            source,
            store,
            account,
            project,
            max_parallel_file_streams,
        } => {
            let namespace = Namespace::new(&account, &project)?;
            let service = SyncService::new(FsStore::open(&store, &namespace)?);
            let sink = StoreSink::new(&service);
            let params = SyncParams {
                max_parallel_file_streams,
            };
            let report = espejo::sync(&source, &sink, &params, &CancelToken::new())?;
            println!(
                "synced: {} dirs created, {} files created, {} files patched, {} deleted",
                report.dirs_created, report.files_created, report.files_patched, report.deleted
            );
            Ok(())
        }

        Commands::Sum { file, block_size } => {
            let meta = fs::metadata(&file)?;
            let name = file
                .file_name()
                .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
            let info = FileInfo::from_metadata(&name, &meta);
            let block_size = block_size.unwrap_or_else(|| block_size_for(info.size));

            let mut reader = fs::File::open(&file)?;
            let sum = summarize_with_block_size(&mut reader, info, block_size)?;
            println!("{name}: {} bytes, block size {block_size}", sum.info.size);
            for (i, block) in sum.blocks.iter().enumerate() {
                println!("  block {i}: size {:>6}  fast {:08x}  strong {}", block.size, block.fast, block.strong);
            }
            Ok(())
        }

        Commands::Delta {
            source,
            sink,
            output,
        } => {
            let sink_meta = fs::metadata(&sink)?;
            let sink_info = FileInfo::from_metadata("sink", &sink_meta);
            let block_size = block_size_for(sink_info.size);
            let mut sink_reader = fs::File::open(&sink)?;
            let sink_sum = summarize_with_block_size(&mut sink_reader, sink_info, block_size)?;

            let out_path = output.unwrap_or_else(|| source.with_extension("patch"));
            let out = fs::File::create(&out_path)?;
            let mut enc = PatchEncoder::new(std::io::BufWriter::new(out));
            let src = fs::File::open(&source)?;
            let written = generate_delta(std::io::BufReader::new(src), &sink_sum, |event| {
                match event {
                    DeltaEvent::Literal(data) => enc.write_literal(data),
                    DeltaEvent::BlockRef(i) => enc.write_block_ref(i),
                }
                .map(|n| n as u64)
            })?;
            enc.finish()?;
            println!("wrote {written} patch bytes to {}", out_path.display());
            Ok(())
        }

        Commands::Patch {
            sink,
            patch,
            output,
        } => {
            let sink_meta = fs::metadata(&sink)?;
            let sink_info = FileInfo::from_metadata("sink", &sink_meta);
            let block_size = block_size_for(sink_info.size);
            let mut sink_reader = fs::File::open(&sink)?;
            let sink_sum = summarize_with_block_size(&mut sink_reader, sink_info, block_size)?;

            let out_path = output.unwrap_or_else(|| sink.with_extension("patched"));
            let out = fs::File::create(&out_path)?;
            let basis = fs::File::open(&sink)?;

            let mut writer = std::io::BufWriter::new(out);
            let mut patcher = FilePatcher::new(basis, &mut writer, &sink_sum);
            let written = patcher.apply_from(std::io::BufReader::new(fs::File::open(&patch)?))?;
            let stream_sum = patcher.finish();
            std::io::Write::flush(&mut writer)?;
            println!(
                "wrote {written} bytes to {} (stream hash {stream_sum})",
                out_path.display()
            );
            Ok(())
        }
    }
}
