//! Checks that the source exists and prints a directory record for each of its ancestors.

use std::io::{BufWriter, Write};
use std::path::Path;

use backupfs_core::Result;
use backupfs_core::layout::{normalize_absolute, source_ancestor_records};
use backupfs_core::logging::init_logging;
use backupfs_helpers::{finish, path_arg, positional_args, usage};

const PROGRAM: &str = "backupfs-chksrc";

fn main() {
    init_logging();
    finish(PROGRAM, run());
}

fn run() -> Result<()> {
    let args = positional_args();
    let [source] = args.as_slice() else {
        return Err(usage(PROGRAM, "<source>"));
    };
    let source = normalize_absolute(&path_arg(source), "source")?;
    let records = source_ancestor_records(&source, Path::new(""))?;

    let mut out = BufWriter::new(std::io::stdout().lock());
    for record in &records {
        out.write_all(&record.to_line())?;
    }
    out.flush()?;
    Ok(())
}
