use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use wimx_core::{
    CompressionKind, FnProgressSink, ImageSelect, NoopProgress, StreamHash, Wim, WriteFlags,
};

#[derive(Parser)]
#[command(
    name = "wimx",
    version,
    about = "WIM archiver CLI",
    long_about = "Create, append to, list, extract, and verify WIM archives."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive from files and directories.
    Create {
        /// Destination archive path.
        output: PathBuf,

        /// Source files or directories.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Image name stored in the archive metadata.
        #[arg(long, default_value = "image")]
        name: String,

        /// Compression kind for stream payloads.
        #[arg(long, value_enum, default_value_t = CompressionArg::Lzx)]
        compression: CompressionArg,

        /// Number of compressor threads (defaults to CPU count).
        #[arg(long, default_value_t = num_cpus::get())]
        threads: usize,

        /// Append an integrity table.
        #[arg(long)]
        check: bool,

        /// Print final write statistics as JSON.
        #[arg(long)]
        stats_json: bool,
    },
    /// Append files as a new image of an existing archive.
    Append {
        /// Archive to append to.
        archive: PathBuf,

        /// Source files or directories.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Image name stored in the archive metadata.
        #[arg(long, default_value = "image")]
        name: String,

        /// Number of compressor threads (defaults to CPU count).
        #[arg(long, default_value_t = num_cpus::get())]
        threads: usize,

        /// Append an integrity table.
        #[arg(long)]
        check: bool,

        /// Force a full rebuild through a temporary file.
        #[arg(long)]
        rebuild: bool,

        /// Print final write statistics as JSON.
        #[arg(long)]
        stats_json: bool,
    },
    /// Delete an image and rewrite the archive.
    Delete {
        archive: PathBuf,

        /// 1-based image index to delete.
        #[arg(long)]
        image: u32,

        /// Keep the deleted image's bytes and append in place.
        #[arg(long)]
        soft: bool,
    },
    /// Show the images and streams of an archive.
    List { archive: PathBuf },
    /// Extract an image's files into a directory.
    Extract {
        archive: PathBuf,

        /// Directory the files are written into.
        output_dir: PathBuf,

        /// 1-based image index.
        #[arg(long, default_value_t = 1)]
        image: u32,
    },
    /// Verify stream hashes and the integrity table, if present.
    Verify { archive: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Xpress,
    Lzx,
}

impl From<CompressionArg> for CompressionKind {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => CompressionKind::None,
            CompressionArg::Xpress => CompressionKind::Xpress,
            CompressionArg::Lzx => CompressionKind::Lzx,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("wimx: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Create {
            output,
            inputs,
            name,
            compression,
            threads,
            check,
            stats_json,
        } => {
            let mut wim = Wim::create(compression.into());
            add_image_from_inputs(&mut wim, &name, &inputs)?;

            let mut flags = WriteFlags::empty();
            if check {
                flags |= WriteFlags::CHECK_INTEGRITY;
            }
            let stats = write_with_progress(|sink| {
                wim.write(&output, ImageSelect::All, flags, threads, sink)
            })?;
            finish_stats(stats_json, stats);
            println!("created `{}`", output.display());
        }
        Commands::Append {
            archive,
            inputs,
            name,
            threads,
            check,
            rebuild,
            stats_json,
        } => {
            let mut wim = Wim::open(&archive)?;
            add_image_from_inputs(&mut wim, &name, &inputs)?;

            let mut flags = WriteFlags::empty();
            if check {
                flags |= WriteFlags::CHECK_INTEGRITY;
            }
            if rebuild {
                flags |= WriteFlags::REBUILD;
            }
            let stats = write_with_progress(|sink| wim.overwrite(flags, threads, sink))?;
            finish_stats(stats_json, stats);
            println!(
                "appended image {} to `{}`",
                wim.image_count(),
                archive.display()
            );
        }
        Commands::Delete {
            archive,
            image,
            soft,
        } => {
            let mut wim = Wim::open(&archive)?;
            wim.delete_image(image)?;
            let flags = if soft {
                WriteFlags::SOFT_DELETE
            } else {
                WriteFlags::empty()
            };
            wim.overwrite(flags, 0, &mut NoopProgress)?;
            println!("deleted image {image} from `{}`", archive.display());
        }
        Commands::List { archive } => {
            let wim = Wim::open(&archive)?;
            println!(
                "`{}`: {} image(s), {} stream(s), compression {}",
                archive.display(),
                wim.image_count(),
                wim.lookup().len(),
                wim.compression()
            );
            for (i, image) in wim.images().iter().enumerate() {
                let info = wim.info().images.get(i);
                println!(
                    "  [{}] {} ({} files, {} bytes)",
                    i + 1,
                    image.name,
                    info.map(|info| info.file_count).unwrap_or(0),
                    info.map(|info| info.total_bytes).unwrap_or(0),
                );
            }
        }
        Commands::Extract {
            archive,
            output_dir,
            image,
        } => {
            let wim = Wim::open(&archive)?;
            let count = extract_image(&wim, image, &output_dir)?;
            println!(
                "extracted {count} file(s) from image {image} into `{}`",
                output_dir.display()
            );
        }
        Commands::Verify { archive } => {
            let wim = Wim::open(&archive)?;
            let mut bad = 0usize;
            for entry in wim.lookup().iter() {
                if let Err(err) = wim.extract_stream(&entry.hash) {
                    eprintln!("stream {}: {err}", entry.hash);
                    bad += 1;
                }
            }
            match wim.verify_integrity(&mut NoopProgress)? {
                Some(true) => println!("integrity table: ok"),
                Some(false) => {
                    println!("integrity table: MISMATCH");
                    bad += 1;
                }
                None => println!("integrity table: absent"),
            }
            if bad > 0 {
                return Err(format!("{bad} verification failure(s)").into());
            }
            println!("{} stream(s) ok", wim.lookup().len());
        }
    }
    Ok(())
}

/// Adds an image whose metadata blob is a manifest of `hash<TAB>path` lines,
/// which is all the extraction side needs to lay files back out.
fn add_image_from_inputs(
    wim: &mut Wim,
    name: &str,
    inputs: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut files = Vec::new();
    for input in inputs {
        collect_files(input, Path::new(""), &mut files)?;
    }
    if files.is_empty() {
        return Err("no files found under the given inputs".into());
    }

    let mut manifest = String::new();
    let mut hashes = Vec::with_capacity(files.len());
    for (label, path) in &files {
        let hash = wim.add_stream_from_file(path)?;
        manifest.push_str(&format!("{hash}\t{}\n", label.display()));
        hashes.push(hash);
    }
    wim.add_image(name, manifest.into_bytes().into(), &hashes)?;
    Ok(())
}

fn collect_files(
    path: &Path,
    prefix: &Path,
    files: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let metadata = fs::metadata(path)?;
    if metadata.is_file() {
        let label = if prefix.as_os_str().is_empty() {
            PathBuf::from(path.file_name().ok_or("input path has no file name")?)
        } else {
            prefix.to_path_buf()
        };
        files.push((label, path.to_path_buf()));
        return Ok(());
    }
    if metadata.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let child_prefix = prefix.join(entry.file_name());
            collect_files(&entry.path(), &child_prefix, files)?;
        }
    }
    Ok(())
}

fn extract_image(
    wim: &Wim,
    image: u32,
    output_dir: &Path,
) -> Result<usize, Box<dyn std::error::Error>> {
    if image == 0 {
        return Err("image indices start at 1".into());
    }
    let metadata_hash = wim
        .images()
        .get(image as usize - 1)
        .ok_or_else(|| format!("image {image} does not exist"))?
        .metadata_hash;
    let manifest = wim.extract_stream(&metadata_hash)?;
    let manifest = String::from_utf8(manifest)?;

    let mut count = 0usize;
    for line in manifest.lines().filter(|line| !line.is_empty()) {
        let (hash_hex, label) = line
            .split_once('\t')
            .ok_or("malformed image manifest line")?;
        let hash = parse_hash(hash_hex).ok_or("malformed stream hash in manifest")?;

        let relative = sanitize_relative(Path::new(label))
            .ok_or_else(|| format!("manifest path `{label}` escapes the output directory"))?;
        let target = output_dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = wim.extract_stream(&hash)?;
        let mut file = fs::File::create(&target)?;
        file.write_all(&data)?;
        count += 1;
    }
    Ok(count)
}

fn parse_hash(hex: &str) -> Option<StreamHash> {
    if hex.len() != 40 {
        return None;
    }
    let mut bytes = [0u8; 20];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(StreamHash::from(bytes))
}

/// Keeps extraction inside the output directory: no roots, no parent hops.
fn sanitize_relative(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn write_with_progress<F>(
    write: F,
) -> Result<Option<wimx_core::WriteProgress>, wimx_core::WimError>
where
    F: FnOnce(&mut FnProgressSink<&mut dyn FnMut(&wimx_core::WriteProgress)>) -> Result<(), wimx_core::WimError>,
{
    let mut last: Option<wimx_core::WriteProgress> = None;
    let mut on_progress = |progress: &wimx_core::WriteProgress| {
        if progress.total_bytes > 0 {
            eprint!(
                "\r{}/{} streams, {}/{} bytes ({} thread(s))",
                progress.completed_streams,
                progress.total_streams,
                progress.completed_bytes,
                progress.total_bytes,
                progress.num_threads,
            );
        }
        last = Some(*progress);
    };
    let mut sink = FnProgressSink {
        callback: &mut on_progress as &mut dyn FnMut(&wimx_core::WriteProgress),
    };
    let result = write(&mut sink);
    eprintln!();
    result?;
    Ok(last)
}

fn finish_stats(stats_json: bool, stats: Option<wimx_core::WriteProgress>) {
    if !stats_json {
        return;
    }
    if let Some(stats) = stats {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("wimx: could not serialize stats: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_plain_relative_paths() {
        assert_eq!(
            sanitize_relative(Path::new("dir/sub/file.txt")),
            Some(PathBuf::from("dir/sub/file.txt"))
        );
        assert_eq!(
            sanitize_relative(Path::new("./dir/file.txt")),
            Some(PathBuf::from("dir/file.txt"))
        );
    }

    #[test]
    fn sanitize_rejects_escaping_paths() {
        assert_eq!(sanitize_relative(Path::new("../file.txt")), None);
        assert_eq!(sanitize_relative(Path::new("dir/../../file.txt")), None);
        assert_eq!(sanitize_relative(Path::new("/etc/passwd")), None);
        assert_eq!(sanitize_relative(Path::new("")), None);
        assert_eq!(sanitize_relative(Path::new(".")), None);
    }

    #[test]
    fn parse_hash_round_trips_manifest_lines() {
        let hash = StreamHash::of(b"manifest entry");
        let parsed = parse_hash(&hash.to_string()).expect("formatted hash parses");
        assert_eq!(parsed, hash);
    }

    #[test]
    fn parse_hash_rejects_malformed_input() {
        assert_eq!(parse_hash(""), None);
        assert_eq!(parse_hash("da39a3ee"), None);
        assert_eq!(
            parse_hash("zz39a3ee5e6b4b0d3255bfef95601890afd80709"),
            None
        );
        // 41 characters.
        assert_eq!(
            parse_hash("da39a3ee5e6b4b0d3255bfef95601890afd807090"),
            None
        );
    }
}
