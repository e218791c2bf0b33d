#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use e2fs::{
    ByteDevice, DirEntry, FileByteDevice, FileType, FormatOptions, FsOps, InodeNumber, Mount,
    MountArgs, Superblock, format,
};
use serde::Serialize;
use std::env;
use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Default image size for `mkfs --create`.
const DEFAULT_IMAGE_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct ErrorSummary {
    time: u32,
    ino: u32,
    func: String,
    line: u32,
    code: u64,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    blocks_count: u32,
    free_blocks: u32,
    reserved_blocks: u32,
    inodes_count: u32,
    free_inodes: u32,
    groups: u32,
    inode_size: u16,
    volume_name: String,
    uuid: String,
    clean: bool,
    mount_count: u16,
    features: Vec<&'static str>,
    error_count: u32,
    first_error: Option<ErrorSummary>,
    last_error: Option<ErrorSummary>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(image) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&image), json)
        }
        "ls" => {
            let (image, path) = image_and_path(&mut args, "ls")?;
            let json = args.any(|arg| arg == "--json");
            ls(Path::new(&image), &path, json)
        }
        "cat" => {
            let (image, path) = image_and_path(&mut args, "cat")?;
            cat(Path::new(&image), &path)
        }
        "mkdir" => {
            let (image, path) = image_and_path(&mut args, "mkdir")?;
            mkdir(Path::new(&image), &path)
        }
        "mkfs" => {
            let Some(image) = args.next() else {
                bail!("mkfs requires an image path");
            };
            let rest: Vec<String> = args.collect();
            mkfs(Path::new(&image), &rest)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("e2fs\n");
    println!("USAGE:");
    println!("  e2fs inspect <image> [--json]");
    println!("  e2fs ls <image> <path> [--json]");
    println!("  e2fs cat <image> <path>");
    println!("  e2fs mkdir <image> <path>");
    println!(
        "  e2fs mkfs <image> [--create <bytes>] [--block-size <n>] [--inode-size <n>] \
         [--label <name>] [--metadata-csum] [--inline-data]"
    );
}

fn image_and_path(args: &mut impl Iterator<Item = String>, command: &str) -> Result<(String, String)> {
    let (Some(image), Some(path)) = (args.next(), args.next()) else {
        bail!("{command} requires <image> <path>");
    };
    Ok((image, path))
}

fn open_image(path: &Path, readonly: bool) -> Result<Mount> {
    let device = if readonly {
        FileByteDevice::open_read_only(path)
    } else {
        FileByteDevice::open(path)
    }
    .with_context(|| format!("failed to open image {}", path.display()))?;
    let device: Arc<dyn ByteDevice> = Arc::new(device);
    let args = MountArgs {
        readonly,
        ..MountArgs::default()
    };
    Mount::mount(device, &args).with_context(|| format!("failed to mount {}", path.display()))
}

fn error_summary(sb: &Superblock, first: bool) -> Option<ErrorSummary> {
    let record = if first { sb.first_error } else { sb.last_error };
    (record.time != 0).then(|| ErrorSummary {
        time: record.time,
        ino: record.ino,
        func: record.func_name(),
        line: record.line,
        code: record.block,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let mount = open_image(path, true)?;
    let fs = mount.fs();
    let sb = fs.superblock();
    let mut features = sb.feature_compat.describe();
    features.extend(sb.feature_incompat.describe());
    features.extend(sb.feature_ro_compat.describe());

    let output = InspectOutput {
        block_size: fs.block_size(),
        blocks_count: sb.blocks_count,
        free_blocks: sb.free_blocks_count,
        reserved_blocks: sb.r_blocks_count,
        inodes_count: sb.inodes_count,
        free_inodes: sb.free_inodes_count,
        groups: fs.geometry().group_count,
        inode_size: sb.inode_size(),
        volume_name: sb.volume_name(),
        uuid: hex(&sb.uuid),
        clean: sb.state & 1 != 0,
        mount_count: sb.mnt_count,
        features,
        error_count: sb.error_count,
        first_error: error_summary(&sb, true),
        last_error: error_summary(&sb, false),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("e2fs inspector");
        println!("block_size: {}", output.block_size);
        println!("blocks: {} ({} free, {} reserved)", output.blocks_count, output.free_blocks, output.reserved_blocks);
        println!("inodes: {} ({} free, {} bytes each)", output.inodes_count, output.free_inodes, output.inode_size);
        println!("groups: {}", output.groups);
        println!("volume_name: {}", output.volume_name);
        println!("uuid: {}", output.uuid);
        println!("state: {}", if output.clean { "clean" } else { "not clean" });
        println!("mount_count: {}", output.mount_count);
        println!("features: {}", output.features.join(" "));
        println!("error_count: {}", output.error_count);
        for (label, record) in [("first_error", &output.first_error), ("last_error", &output.last_error)] {
            if let Some(e) = record {
                println!("{label}: ino {} at {}:{} (code {}) time {}", e.ino, e.func, e.line, e.code, e.time);
            }
        }
    }
    mount.unmount().context("unmount")
}

fn kind_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::BlockDevice => 'b',
        FileType::CharDevice => 'c',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::RegularFile => '-',
    }
}

fn ls(image: &Path, path: &str, json: bool) -> Result<()> {
    let mount = open_image(image, true)?;
    let dir = mount
        .fs()
        .namei(path.as_bytes())
        .with_context(|| format!("cannot resolve {path}"))?;

    let mut entries: Vec<DirEntry> = Vec::new();
    let mut cookie = 0;
    loop {
        let batch = mount.readdir(dir, cookie).with_context(|| format!("cannot list {path}"))?;
        let Some(last) = batch.last() else {
            break;
        };
        cookie = last.offset;
        entries.extend(batch);
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize output")?
        );
    } else {
        for entry in &entries {
            let attr = mount.getattr(entry.ino).context("getattr")?;
            println!(
                "{}{:04o} {:>8} {:>10} {}",
                kind_char(entry.kind),
                attr.perm,
                entry.ino.0,
                attr.size,
                entry.name_str()
            );
        }
    }
    mount.unmount().context("unmount")
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let mount = open_image(image, true)?;
    let ino = mount
        .fs()
        .namei(path.as_bytes())
        .with_context(|| format!("cannot resolve {path}"))?;
    let size = mount.getattr(ino).context("getattr")?.size;

    let mut out = std::io::stdout().lock();
    let mut offset = 0;
    while offset < size {
        let chunk = mount.read(ino, offset, 64 * 1024).with_context(|| format!("cannot read {path}"))?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk).context("write stdout")?;
        offset += chunk.len() as u64;
    }
    out.flush().context("flush stdout")?;
    drop(out);
    mount.unmount().context("unmount")
}

fn mkdir(image: &Path, path: &str) -> Result<()> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };
    if name.is_empty() {
        bail!("mkdir needs a directory name");
    }
    let mount = open_image(image, false)?;
    let parent_ino = if parent.is_empty() {
        InodeNumber::ROOT
    } else {
        mount
            .fs()
            .namei(parent.as_bytes())
            .with_context(|| format!("cannot resolve {parent}"))?
    };
    let attr = mount
        .mkdir(parent_ino, OsStr::new(name), 0o755)
        .with_context(|| format!("cannot create {path}"))?;
    eprintln!("created {path} (inode {})", attr.ino.0);
    mount.unmount().context("unmount")
}

fn parse_mkfs_options(rest: &[String]) -> Result<(FormatOptions, Option<u64>)> {
    let mut opts = FormatOptions::default();
    let mut create = None;
    let mut iter = rest.iter();
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{name} requires a value"))
        };
        match flag.as_str() {
            "--create" => create = Some(value("--create")?.parse().context("--create")?),
            "--block-size" => opts.block_size = value("--block-size")?.parse().context("--block-size")?,
            "--inode-size" => opts.inode_size = value("--inode-size")?.parse().context("--inode-size")?,
            "--label" => opts.volume_name = value("--label")?,
            "--metadata-csum" => opts.metadata_csum = true,
            "--inline-data" => opts.inline_data = true,
            other => bail!("unknown mkfs option: {other}"),
        }
    }
    Ok((opts, create))
}

fn mkfs(image: &Path, rest: &[String]) -> Result<()> {
    let (opts, create) = parse_mkfs_options(rest)?;
    let device = match create {
        Some(len) => FileByteDevice::create(image, len),
        None if !image.exists() => FileByteDevice::create(image, DEFAULT_IMAGE_BYTES),
        None => FileByteDevice::open(image),
    }
    .with_context(|| format!("failed to open image {}", image.display()))?;
    let device: Arc<dyn ByteDevice> = Arc::new(device);
    format(device, &opts).with_context(|| format!("failed to format {}", image.display()))?;
    eprintln!("formatted {}", image.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn mkfs_flags_fill_options() {
        let (opts, create) = parse_mkfs_options(&strings(&[
            "--create",
            "4194304",
            "--inode-size",
            "256",
            "--label",
            "scratch",
            "--inline-data",
        ]))
        .expect("parse");
        assert_eq!(create, Some(4 * 1024 * 1024));
        assert_eq!(opts.inode_size, 256);
        assert_eq!(opts.volume_name, "scratch");
        assert!(opts.inline_data);
        assert!(!opts.metadata_csum);
    }

    #[test]
    fn mkfs_flags_reject_junk() {
        assert!(parse_mkfs_options(&strings(&["--block-size"])).is_err());
        assert!(parse_mkfs_options(&strings(&["--bogus"])).is_err());
        assert!(parse_mkfs_options(&strings(&["--block-size", "big"])).is_err());
    }

    #[test]
    fn image_on_disk_formats_and_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("vol.img");
        mkfs(&image, &strings(&["--create", "1048576", "--label", "t"])).expect("mkfs");
        mkdir(&image, "/docs").expect("mkdir");

        let mount = open_image(&image, true).expect("mount");
        assert_eq!(mount.fs().superblock().volume_name(), "t");
        let docs = mount.fs().namei(b"/docs").expect("namei");
        assert_eq!(mount.getattr(docs).expect("attr").kind, FileType::Directory);
        let names: Vec<String> = mount
            .readdir(InodeNumber::ROOT, 0)
            .expect("readdir")
            .iter()
            .map(DirEntry::name_str)
            .collect();
        assert_eq!(names, vec![".", "..", "lost+found", "docs"]);
    }

    #[test]
    fn hex_renders_uuid_bytes() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
