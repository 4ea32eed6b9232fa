#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rmxfs_check::{CheckReport, check_image};
use rmxfs_error::RmxError;
use rmxfs_image::{Directory, RmxImage};
use rmxfs_ondisk::Fnode;
use rmxfs_types::{access_string, type_name};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rmxfs", about = "Tool for inspecting and modifying iRMX disk images")]
struct Cli {
    /// Image file to operate on.
    #[arg(short = 'f', long = "filename", global = true, default_value = "test.img")]
    filename: PathBuf,

    /// Swap low and high bytes across the whole image.
    #[arg(short = 'b', long = "byteswap", global = true)]
    byteswap: bool,

    /// Hide nonessential output.
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump volume structures to stdout.
    Dump,
    /// Show one file's fnode and block lists.
    Stat {
        /// Path inside the image.
        path: String,
    },
    /// List directory contents.
    Dir {
        /// Directory path inside the image (defaults to the root).
        path: Option<String>,
    },
    /// Check the image for consistency errors.
    Chkdsk {
        /// Output the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Copy files out of the image to the local disk.
    Get {
        /// Paths inside the image.
        #[arg(required = true)]
        paths: Vec<String>,
        /// Output filename (`-` for stdout; defaults to the leaf name).
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Copy local files into the image.
    Put {
        /// Local files to store.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Parent directory inside the image.
        #[arg(short = 'd', long)]
        directory: Option<String>,
        /// Name to store under (defaults to the local basename).
        #[arg(short = 'n', long)]
        name: Option<String>,
        /// Require one contiguous block run.
        #[arg(short = 'c', long)]
        contig: bool,
    },
    /// Delete files from the image.
    Delete {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Create directories inside the image.
    Mkdir {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Delete every non-system file on the image.
    Wipe,
    /// Show free block and fnode counts.
    Free {
        /// Output the counts as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Recursively extract a directory tree to the local disk.
    Gettree {
        /// Directory path inside the image (defaults to the root).
        path: Option<String>,
        /// Local directory to extract into.
        #[arg(short = 'o', long, default_value = ".")]
        output: PathBuf,
    },
    /// Grow the fnode table to hold more files.
    Incfnode {
        /// New fnode table capacity.
        count: u16,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    if let Err(error) = run(&cli) {
        eprintln!("Fatal error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Dump => dump(cli),
        Command::Stat { path } => stat(cli, path),
        Command::Dir { path } => dir(cli, path.as_deref()),
        Command::Chkdsk { json } => chkdsk(cli, *json),
        Command::Get { paths, output } => get(cli, paths, output.as_deref()),
        Command::Put {
            files,
            directory,
            name,
            contig,
        } => put(cli, files, directory.as_deref(), name.as_deref(), *contig),
        Command::Delete { paths } => delete(cli, paths),
        Command::Mkdir { paths } => mkdir(cli, paths),
        Command::Wipe => wipe(cli),
        Command::Free { json } => free(cli, *json),
        Command::Gettree { path, output } => gettree(cli, path.as_deref(), output),
        Command::Incfnode { count } => incfnode(cli, *count),
    }
}

fn load_image(cli: &Cli) -> Result<RmxImage> {
    RmxImage::load(&cli.filename, cli.byteswap)
        .with_context(|| format!("failed to load image {}", cli.filename.display()))
}

/// Resolve the parent directory a `put`/`mkdir` style command targets.
fn parent_dir(image: &RmxImage, dir_name: Option<&str>) -> Result<Fnode> {
    match dir_name {
        Some(name) if !name.is_empty() && name != "." => {
            let hit = image.lookup(None, name)?;
            if !hit.fnode.is_directory() {
                bail!("{name} is not a directory");
            }
            Ok(hit.fnode)
        }
        _ => Ok(image.root_fnode()?),
    }
}

// ── Read-only commands ──────────────────────────────────────────────────────

fn dump(cli: &Cli) -> Result<()> {
    let image = load_image(cli)?;

    let iso = image.iso_volume_label()?;
    println!("LabelId: {}", iso.label_id);
    println!("Name: {}", iso.name);
    println!("Struc: {}", iso.structure);
    println!("Side: {}", iso.side);
    println!("Interleave: {}", iso.interleave);
    println!("IsoVersion: {}", iso.version);
    println!();

    let vl = image.volume_label()?;
    println!("Name: {}", vl.name);
    println!("Fill: {}", vl.fill);
    println!("Driver: {}", vl.driver);
    println!("Granularity: {}", vl.gran);
    println!("Size: {}", vl.size);
    println!("Max Fnode: {}", vl.max_fnode);
    println!("Fnode Start: {}", vl.fnode_start);
    println!("Fnode Size: {}", vl.fnode_size);
    println!("Root Fnode: {}", vl.root_fnode);

    for index in 0..vl.max_fnode {
        let fnode = image.fnode(index)?;
        if fnode.is_allocated() {
            println!();
            println!("---- FNode {index} ----");
            print_fnode(&fnode);
        }
    }

    println!("\nVol Map:");
    print_ranges(&image.volume_map()?.bits.alloc_ranges());
    println!("\nFNode Map:");
    print_ranges(&image.fnode_map()?.bits.alloc_ranges());
    println!();

    let root = image.root_fnode()?;
    let dir = image.directory(&root)?;
    for entry in dir.live_entries() {
        println!("{:<15} {:8}", entry.name, entry.fnode);
    }

    Ok(())
}

fn print_ranges(ranges: &[(usize, usize)]) {
    let mut line = String::new();
    for (start, end) in ranges {
        line.push_str(&format!("{start}-{end} "));
    }
    println!("{line}");
}

fn print_fnode(fnode: &Fnode) {
    let mut flags = format!("Flags: {}", fnode.flags);
    if fnode.is_allocated() {
        flags.push_str(" ALLOC");
    }
    if fnode.is_long() {
        flags.push_str(" LONG");
    }
    println!("{flags}");

    match type_name(fnode.ftype) {
        Some(name) => println!("FType: {} ({name})", fnode.ftype),
        None => println!("FType: {} (Unknown Type {})", fnode.ftype, fnode.ftype),
    }

    println!("Gran: {}", fnode.gran);
    println!("Owner: {}", fnode.owner);
    println!("CreateTime: {}", fnode.create_time);
    println!("AccessTime: {}", fnode.access_time);
    println!("ModifyTime: {}", fnode.modify_time);
    println!("TotalSize: {}", fnode.total_size);
    println!("TotalBlocks: {}", fnode.total_blocks);
    for (i, p) in fnode.pointers.iter().enumerate() {
        println!(
            "Pointer[{i}]: NumBlocks={}, BlockPointer={}",
            p.num_blocks, p.block
        );
    }
    println!("ThisSize: {}", fnode.this_size);
    println!("ReservedA: {}", fnode.reserved_a);
    println!("ReservedB: {}", fnode.reserved_b);
    println!("IDCount: {}", fnode.id_count);
    for (i, acc) in fnode.accessors.iter().enumerate() {
        println!("Accessor[{i}]: Access={}, Id={}", acc.access, acc.id);
    }
    println!("Parent: {}", fnode.parent);
}

fn stat(cli: &Cli, path: &str) -> Result<()> {
    let image = load_image(cli)?;
    let mut hit = image.lookup(None, path)?;
    print_fnode(&hit.fnode);

    image.read_file(&mut hit.fnode)?;
    print!("Indirect Blocks:");
    for block in &hit.fnode.indirect_blocks {
        print!(" {block}");
    }
    println!();
    print!("Blocks:");
    for block in &hit.fnode.data_blocks {
        print!(" {block}");
    }
    println!();
    Ok(())
}

fn dir(cli: &Cli, path: Option<&str>) -> Result<()> {
    let image = load_image(cli)?;
    let hit = image.lookup(None, path.unwrap_or(""))?;
    let dir = image.directory(&hit.fnode)?;

    println!(
        "{:<15} {:>8} {:>8} {:<12} {} {}",
        "Name", "FNode", "Size", " Type", "Flags", " Accessors"
    );
    println!(
        "{:<15} {:>8} {:>8} {:<12} {} {}",
        "----", "-----", "----", " ----", "-----", " ---------"
    );
    for entry in dir.live_entries() {
        print!("{:<15} {:8}", entry.name, entry.fnode);
        match image.fnode(entry.fnode) {
            Err(_) => println!(" ERR"),
            Ok(fnode) => {
                print!(" {:8}", fnode.total_size);
                print!("  {:<12}", type_name(fnode.ftype).unwrap_or("Unknown"));
                print!("{}", if fnode.is_allocated() { "A" } else { " " });
                print!("{}", if fnode.is_long() { "L" } else { " " });
                print!("{}", if fnode.is_primary() { "P" } else { " " });
                print!("{}", if fnode.is_unmodified() { "U" } else { " " });
                print!("{}", if fnode.is_no_delete() { "N" } else { " " });
                print!(" ");
                for acc in fnode.accessors.iter().take(usize::from(fnode.id_count)) {
                    if acc.access != 0 {
                        print!(" {}:{}", access_string(acc.access), acc.id);
                    }
                }
                println!();
            }
        }
    }
    Ok(())
}

fn chkdsk(cli: &Cli, json: bool) -> Result<()> {
    let image = load_image(cli)?;
    let report = check_image(&image)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_check_report(cli, &report);
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_check_report(cli: &Cli, report: &CheckReport) {
    for finding in &report.findings {
        println!("  {finding}");
    }
    if report.is_clean() {
        if !cli.quiet {
            println!("Disk check completed successfully, no errors found.");
        }
    } else {
        println!("Disk check completed with {} errors.", report.error_count());
    }
}

fn free(cli: &Cli, json: bool) -> Result<()> {
    let image = load_image(cli)?;
    let counts = image.free_counts()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("Free blocks: {}", counts.blocks);
        println!("Free FNodes: {}", counts.fnodes);
    }
    Ok(())
}

// ── Extraction ──────────────────────────────────────────────────────────────

fn get(cli: &Cli, paths: &[String], output: Option<&Path>) -> Result<()> {
    let image = load_image(cli)?;

    for path in paths {
        let mut hit = image.lookup(None, path)?;
        let data = image.read_file(&mut hit.fnode)?;

        let leaf = hit
            .fnode
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("path {path} has no leaf name"))?;
        let dest = output.map_or_else(|| PathBuf::from(&leaf), Path::to_path_buf);

        if dest.as_os_str() == "-" {
            std::io::stdout().write_all(&data)?;
            continue;
        }

        std::fs::write(&dest, &data)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        if !cli.quiet {
            println!("Wrote {} bytes to {}", data.len(), dest.display());
        }
    }
    Ok(())
}

fn gettree(cli: &Cli, path: Option<&str>, output: &Path) -> Result<()> {
    let image = load_image(cli)?;
    let hit = image.lookup(None, path.unwrap_or(""))?;
    if !hit.fnode.is_directory() {
        bail!("{} is not a directory", path.unwrap_or("/"));
    }
    let dir = image.directory(&hit.fnode)?;
    extract_tree(cli, &image, &dir, output)
}

fn extract_tree(cli: &Cli, image: &RmxImage, dir: &Directory, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;

    for entry in dir.live_entries() {
        let mut fnode = image.fnode(entry.fnode)?;
        let target = dest.join(&entry.name);
        if fnode.is_directory() {
            let sub = image.directory(&fnode)?;
            extract_tree(cli, image, &sub, &target)?;
        } else {
            let data = image.read_file(&mut fnode)?;
            std::fs::write(&target, &data)
                .with_context(|| format!("failed to write {}", target.display()))?;
            if !cli.quiet {
                println!("Wrote {} bytes to {}", data.len(), target.display());
            }
        }
    }
    Ok(())
}

// ── Mutating commands ───────────────────────────────────────────────────────

fn put(
    cli: &Cli,
    files: &[PathBuf],
    directory: Option<&str>,
    name: Option<&str>,
    contig: bool,
) -> Result<()> {
    let mut image = load_image(cli)?;

    for file in files {
        let data = std::fs::read(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let base = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("{} has no usable basename", file.display()))?;
        let dest_name = name.unwrap_or(base);

        let parent = parent_dir(&image, directory)?;

        // Replace an existing entry rather than shadowing it.
        match image.lookup(Some(&parent), dest_name) {
            Ok(mut existing) => {
                if !cli.quiet {
                    println!("Deleting existing {dest_name} before storing the new copy");
                }
                let mut dir = existing
                    .parent
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("{dest_name} has no parent directory"))?;
                image.delete_fnode(&mut existing.fnode, &mut dir)?;
            }
            Err(RmxError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let fnode = image.put_file(&parent, dest_name, &data, contig)?;
        if !cli.quiet {
            println!(
                "Stored {} bytes to FNode {} ({dest_name})",
                data.len(),
                fnode.number
            );
        }
    }

    image.save()?;
    Ok(())
}

fn delete(cli: &Cli, paths: &[String]) -> Result<()> {
    let mut image = load_image(cli)?;

    for path in paths {
        let mut hit = image.lookup(None, path)?;
        let mut dir = hit
            .parent
            .take()
            .ok_or_else(|| anyhow::anyhow!("cannot delete {path}: it has no parent directory"))?;
        image.delete_fnode(&mut hit.fnode, &mut dir)?;
    }

    image.save()?;
    Ok(())
}

fn mkdir(cli: &Cli, paths: &[String]) -> Result<()> {
    let mut image = load_image(cli)?;

    for path in paths {
        let (dir_name, base) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, base)) => (Some(dir), base),
            None => (None, path.trim_end_matches('/')),
        };
        if base.is_empty() {
            bail!("cannot create a directory with an empty name");
        }
        let parent = parent_dir(&image, dir_name)?;
        image.mkdir(&parent, base)?;
        if !cli.quiet {
            println!("Created directory {path}");
        }
    }

    image.save()?;
    Ok(())
}

fn wipe(cli: &Cli) -> Result<()> {
    let mut image = load_image(cli)?;
    image.wipe()?;
    image.save()?;
    if !cli.quiet {
        println!("Wiped all non-system files");
    }
    Ok(())
}

fn incfnode(cli: &Cli, count: u16) -> Result<()> {
    let mut image = load_image(cli)?;
    image.grow_fnode_table(count)?;
    image.save()?;
    if !cli.quiet {
        println!("Fnode table grown to {count} entries");
    }
    Ok(())
}
