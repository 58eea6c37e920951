#![expect(clippy::print_stderr, reason = "allowed in examples")]
use std::{
    borrow::Cow,
    fs,
    io::{BufWriter, Read},
    path::{Path, PathBuf},
    time::Instant,
};

use indicatif::{HumanBytes, HumanCount, MultiProgress, ProgressBar, ProgressStyle};
use tarindex_enc::Writer;

#[derive(Debug, clap::Parser)]
struct Cli {
    #[arg(short, long)]
    input: PathBuf,
    #[arg(short, long)]
    output: PathBuf,

    #[arg(short, long)]
    force: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli: Cli = clap::Parser::parse();

    let inst = Instant::now();

    let fout = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .create_new(!cli.force)
        .open(&cli.output)?;

    let stat = {
        let progress = ProgressBar::new_spinner();
        let mut stat = Stats::default();
        traverse_stats(&cli.input, &mut stat, &progress)?;
        progress.finish();
        stat
    };

    let pb_in_bytes = ProgressBar::new(stat.total_bytes).with_style(
        ProgressStyle::with_template(
            "input : {binary_bytes}/{binary_total_bytes} ({binary_bytes_per_sec}) {wide_bar}",
        )
        .unwrap(),
    );
    let pb_out_bytes = ProgressBar::no_length()
        .with_style(ProgressStyle::with_template("output: {binary_bytes} {spinner}").unwrap());
    let fout_pb = pb_out_bytes.wrap_write(&fout);

    let pbs = MultiProgress::new();
    pbs.add(pb_in_bytes.clone());
    pbs.add(pb_out_bytes.clone());
    pb_in_bytes.tick();
    pb_out_bytes.tick();

    let mut writer = Writer::new(BufWriter::new(fout_pb));
    pack_dir(&mut writer, &cli.input, &pb_in_bytes)?;
    pb_in_bytes.finish();

    pbs.println(format!(
        "writing index of {} records",
        HumanCount(writer.len()),
    ))?;
    writer.close()?;
    drop(writer);
    pb_out_bytes.finish();

    let output_len = fout.metadata()?.len();
    eprintln!(
        "completed in {:?}, {} records, {} input, {} output",
        inst.elapsed(),
        HumanCount(stat.files),
        HumanBytes(stat.total_bytes),
        HumanBytes(output_len),
    );

    Ok(())
}

#[derive(Debug, Default)]
struct Stats {
    files: u64,
    total_bytes: u64,
}

fn traverse_stats(
    root_path: &Path,
    stat: &mut Stats,
    progress: &ProgressBar,
) -> std::io::Result<()> {
    for ent in fs::read_dir(root_path)? {
        let ent = ent?;
        let ft = ent.file_type()?;
        if ft.is_dir() {
            traverse_stats(&ent.path(), stat, progress)?;
        } else if ft.is_file() {
            stat.files += 1;
            stat.total_bytes += fs::symlink_metadata(ent.path())?.len();

            if stat.files % 1024 == 0 {
                progress.set_message(format!(
                    "found {} files, total {}",
                    HumanCount(stat.files),
                    HumanBytes(stat.total_bytes),
                ));
            }
        }
    }
    Ok(())
}

/// Append every regular file under `root_path` as a record named by its
/// `/`-separated relative path, in directory order.
fn pack_dir<W: std::io::Write>(
    writer: &mut Writer<W>,
    root_path: &Path,
    pb_in_bytes: &ProgressBar,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stack = vec![(String::new(), fs::read_dir(root_path)?)];
    let mut buf = Vec::new();

    while let Some((prefix, iter)) = stack.last_mut() {
        let Some(ent) = iter.next().transpose()? else {
            stack.pop();
            continue;
        };

        let name = ent.file_name();
        let name_str = name.to_string_lossy();
        if matches!(name_str, Cow::Owned(_)) {
            eprintln!("normalized non-UTF-8 name: {name:?} -> {name_str:?}");
        }
        let record_name = format!("{prefix}{name_str}");

        let ft = ent.file_type()?;
        if ft.is_dir() {
            let subiter = fs::read_dir(ent.path())?;
            stack.push((record_name + "/", subiter));
        } else if ft.is_file() {
            buf.clear();
            pb_in_bytes
                .wrap_read(fs::File::open(ent.path())?)
                .read_to_end(&mut buf)?;
            writer.write(&record_name, &buf)?;
        } else {
            eprintln!(
                "ignore unsupported file type {:?} for path: {}",
                ft,
                ent.path().display(),
            );
        }
    }
    Ok(())
}
