//! Driver: boots the kernel over a disk image and runs file-system and
//! program-loading commands against it.

use anyhow::{anyhow, bail, Context, Result};
use mimic::disk::SynchDisk;
use minos::Kernel;
use std::env;
use std::process;

const USAGE: &str = "usage: minos -d DISK [-f] [command ...]
  -f                format the disk before anything else
  -c PATH SIZE      create a file of SIZE bytes
  -mkdir PATH       create a directory
  -cp HOST PATH     copy a host file into the file system
  -cat PATH         print a file's contents
  -l PATH           list a directory
  -L PATH           list a directory tree
  -r PATH           remove a file
  -rd PATH          remove an empty directory
  -R PATH           remove a file or directory tree
  -hs PATH          report a file's header overhead
  -x PATH           load a NOFF executable into memory";

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        eprintln!("minos: {:#}", e);
        process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let mut args = args.iter().map(String::as_str).peekable();
    let mut disk_path = None;
    let mut format = false;

    // Global flags come first; everything after is commands.
    while let Some(&arg) = args.peek() {
        match arg {
            "-d" => {
                args.next();
                disk_path = Some(args.next().ok_or_else(|| anyhow!("-d needs a path"))?);
            }
            "-f" => {
                args.next();
                format = true;
            }
            _ => break,
        }
    }
    let disk_path = disk_path.ok_or_else(|| anyhow!("no disk image given\n{}", USAGE))?;
    let disk = SynchDisk::open(disk_path).with_context(|| format!("opening {}", disk_path))?;
    let mut kernel = if format {
        Kernel::format(disk).context("formatting disk")?
    } else {
        Kernel::mount(disk).context("mounting disk")?
    };

    while let Some(command) = args.next() {
        let mut operand = || {
            args.next()
                .ok_or_else(|| anyhow!("{} needs an operand\n{}", command, USAGE))
        };
        match command {
            "-c" => {
                let path = operand()?;
                let size: usize = operand()?.parse().context("file size")?;
                kernel
                    .fs
                    .create(path, size)
                    .with_context(|| format!("creating {}", path))?;
            }
            "-mkdir" => {
                let path = operand()?;
                kernel
                    .fs
                    .create_dir(path)
                    .with_context(|| format!("creating directory {}", path))?;
            }
            "-cp" => {
                let host = operand()?;
                let path = operand()?;
                let bytes =
                    std::fs::read(host).with_context(|| format!("reading {}", host))?;
                kernel
                    .fs
                    .create(path, bytes.len())
                    .with_context(|| format!("creating {}", path))?;
                let id = kernel.fs.open(path)?;
                let n = kernel.fs.write(id, &bytes)?;
                kernel.fs.close_file(id)?;
                if n != bytes.len() {
                    bail!("short write copying {} to {}", host, path);
                }
            }
            "-cat" => {
                let path = operand()?;
                let file = kernel
                    .fs
                    .open_file(path)
                    .with_context(|| format!("opening {}", path))?;
                let mut bytes = vec![0u8; file.length()];
                file.read_at(&mut bytes, 0)?;
                print!("{}", String::from_utf8_lossy(&bytes));
            }
            "-l" => print!("{}", kernel.fs.list(operand()?)?),
            "-L" => print!("{}", kernel.fs.recur_list(operand()?)?),
            "-r" => kernel.fs.remove(operand()?)?,
            "-rd" => kernel.fs.remove_dir(operand()?)?,
            "-R" => kernel.fs.recur_remove(operand()?)?,
            "-hs" => {
                let path = operand()?;
                let (len, headers) = kernel.fs.count_header_size(path)?;
                println!("File {} size: {} bytes", path, len);
                println!(
                    "File header of {} has: {} bytes",
                    path,
                    headers * index_fs::SECTOR_SIZE
                );
            }
            "-x" => {
                let path = operand()?;
                kernel
                    .exec(path)
                    .with_context(|| format!("loading {}", path))?;
                println!(
                    "Loaded {}: {} pages resident",
                    path,
                    kernel.current().space.as_ref().unwrap().num_pages()
                );
            }
            _ => bail!("unknown command {}\n{}", command, USAGE),
        }
    }
    kernel.halt();
    Ok(())
}
