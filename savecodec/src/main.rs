//! Save-format converter: auto-detects the input format by magic and
//! rewrites a var/chara dat file as JSON or binary.
//!
//! Exit codes: 0 success, 1 conversion error, 2 usage error.

use std::env;
use std::path::PathBuf;
use std::process;

use log::debug;

struct Args {
    kind: String,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    to: String,
}

fn usage() -> ! {
    eprintln!("usage: savecodec -kind var|chara -in <input> -out <output> -to json|binary");
    process::exit(2);
}

fn parse_args() -> Args {
    let mut out = Args {
        kind: "var".to_string(),
        input: None,
        output: None,
        to: "json".to_string(),
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.trim_start_matches('-') {
            "kind" => out.kind = args.next().unwrap_or_else(|| usage()),
            "in" => out.input = Some(PathBuf::from(args.next().unwrap_or_else(|| usage()))),
            "out" => out.output = Some(PathBuf::from(args.next().unwrap_or_else(|| usage()))),
            "to" => out.to = args.next().unwrap_or_else(|| usage()),
            _ => usage(),
        }
    }
    out
}

fn main() {
    env_logger::init();
    let args = parse_args();
    let (Some(input), Some(output)) = (args.input, args.output) else {
        usage();
    };
    debug!("converting {} ({}) -> {} ({})", input.display(), args.kind, output.display(), args.to);
    if let Err(e) = era_runtime::convert_dat_file(&args.kind, &input, &output, &args.to) {
        eprintln!("convert failed: {}", e);
        process::exit(1);
    }
    println!("converted {} -> {} ({})", input.display(), output.display(), args.to);
}
