use std::{path::Path, process::ExitCode};

fn main() -> ExitCode {
    env_logger::init();
    let args = std::env::args().collect::<Vec<String>>();
    let path = match &*args {
        [_, cmd, path] if cmd == "verify" => Path::new(path),
        _ => panic!("invalid argument, usage: tarindex-test verify <path>"),
    };

    match tarindex_test::verify(path) {
        Ok(report) => {
            println!("{}: {report}", path.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            ExitCode::FAILURE
        }
    }
}
