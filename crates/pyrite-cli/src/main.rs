use std::{env, fs, process::ExitCode};

use pyrite::CodeUnit;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: pyrite-dis <code-unit-file>");
        return ExitCode::FAILURE;
    };
    let bytes = match read_file(file_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let code = match CodeUnit::load(&bytes) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {file_path} is not a serialized code unit: {err}");
            return ExitCode::FAILURE;
        }
    };
    print!("{}", code.disassemble());
    ExitCode::SUCCESS
}

fn read_file(file_path: &str) -> Result<Vec<u8>, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("cannot read {file_path}: {err}"));
        }
    }
    fs::read(file_path).map_err(|err| format!("cannot read {file_path}: {err}"))
}
