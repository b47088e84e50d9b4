mod cli;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use log::{info, warn};
use sfs::{FileSystem, OpenMode, BLOCK_SIZE};
use sfs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Pack {
            source,
            out,
            blocks,
            inodes,
        } => pack(&source, &out, blocks, inodes),
        Command::Ls { image, blocks } => {
            let fs = mount(&image, blocks)?;
            for entry in fs.list() {
                println!("{:>4} {:>8} {}", entry.inode, entry.size, entry.name);
            }
            println!(
                "{} of {} blocks free",
                fs.free_blocks_count(),
                fs.total_blocks()
            );
            Ok(())
        }
        Command::Cat {
            image,
            name,
            blocks,
        } => {
            let fs = mount(&image, blocks)?;
            let handle = fs.open(&name, OpenMode::Read).map_err(io::Error::other)?;
            let mut data = vec![0; fs.fsize(&handle).map_err(io::Error::other)?];
            let read = fs.read(&handle, &mut data).map_err(io::Error::other)?;
            fs.close(&handle).map_err(io::Error::other)?;
            io::stdout().write_all(&data[..read])
        }
        Command::Rm {
            image,
            name,
            blocks,
        } => {
            let fs = mount(&image, blocks)?;
            fs.delete(&name).map_err(io::Error::other)?;
            fs.sync().map_err(io::Error::other)
        }
    }
}

fn pack(source: &Path, out: &Path, blocks: usize, inodes: usize) -> io::Result<()> {
    println!("source={source:?}\nimage={out:?}");

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(out)?;
    fd.set_len((blocks * BLOCK_SIZE) as u64)?;

    let fs = FileSystem::mount(Arc::new(BlockFile::new(fd)), blocks).map_err(io::Error::other)?;
    fs.format(inodes).map_err(io::Error::other)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("skipping non-UTF-8 file name {:?}", entry.file_name());
            continue;
        };

        let data = fs::read(entry.path())?;
        let handle = fs
            .open(&name, OpenMode::WriteTruncate)
            .map_err(io::Error::other)?;
        let written = fs.write(&handle, &data);
        fs.close(&handle).map_err(io::Error::other)?;

        let written = written.map_err(io::Error::other)?;
        if written < data.len() {
            return Err(io::Error::other(format!(
                "{name:?}: only {written} of {} bytes fit",
                data.len()
            )));
        }
        info!("file={name:?} size={written}");
    }

    fs.sync().map_err(io::Error::other)
}

/// 挂载已有镜像，未指定块数时取整个文件；不是完好的 sfs 镜像时报错，不会重新格式化
fn mount(image: &Path, blocks: Option<usize>) -> io::Result<FileSystem> {
    let fd = OpenOptions::new().read(true).write(true).open(image)?;
    let block_file = Arc::new(BlockFile::new(fd));
    let available = block_file.blocks()?;
    let blocks = blocks.unwrap_or(available);
    if blocks > available {
        return Err(io::Error::other(format!(
            "{image:?} holds only {available} blocks"
        )));
    }
    FileSystem::mount_existing(block_file, blocks)
        .map_err(|err| io::Error::other(format!("{image:?}: {err}")))
}
