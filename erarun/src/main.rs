//! Desktop CLI host: walks a script base directory, compiles the bundle,
//! runs the entry function against stdin input, and prints the outputs
//! (or the JSON result envelope with `-json`).

use std::collections::HashMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use era_runtime::{InputRequest, Output, RunResult, Vm};
use log::{debug, error};
use walkdir::WalkDir;

struct Config {
    base: String,
    entry: String,
    save_fmt: String,
    save_dir: Option<String>,
    json: bool,
    inputs: Vec<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage: erarun -base <dir> [-entry <name>] [-savefmt json|binary|both] \
         [-save-dir <dir>] [-input <value>]... [-json]"
    );
    process::exit(2);
}

fn parse_args() -> Config {
    let mut cfg = Config {
        base: ".".to_string(),
        entry: "TITLE".to_string(),
        save_fmt: "json".to_string(),
        save_dir: None,
        json: false,
        inputs: Vec::new(),
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.trim_start_matches('-') {
            "base" => cfg.base = args.next().unwrap_or_else(|| usage()),
            "entry" => cfg.entry = args.next().unwrap_or_else(|| usage()),
            "savefmt" => cfg.save_fmt = args.next().unwrap_or_else(|| usage()),
            "save-dir" => cfg.save_dir = Some(args.next().unwrap_or_else(|| usage())),
            "input" => cfg.inputs.push(args.next().unwrap_or_else(|| usage())),
            "json" => cfg.json = true,
            "h" | "help" => usage(),
            _ => {
                eprintln!("unknown flag {:?}", arg);
                usage();
            }
        }
    }
    cfg
}

fn load_scripts(root: &str) -> Result<HashMap<String, String>, String> {
    let mut files = HashMap::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| format!("walk {}: {}", root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_uppercase())
            .unwrap_or_default();
        if ext != "ERB" && ext != "ERH" && ext != "CSV" {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("read {}: {}", path.display(), e))?;
        files.insert(rel, content);
    }
    if files.is_empty() {
        return Err(format!("no script files found under {}", root));
    }
    Ok(files)
}

fn attach_stdin_provider(vm: &mut Vm) {
    vm.set_input_provider(Box::new(|req: &InputRequest| {
        let stdin = io::stdin();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(_) => {}
            Err(e) => return Err(era_common::EraError(format!("stdin: {}", e))),
        }
        let mut line = line.trim_end_matches(['\r', '\n']).to_string();
        if req.one_input && !req.numeric {
            line = line.chars().next().map(|c| c.to_string()).unwrap_or_default();
        }
        Ok((line, false))
    }));
}

fn print_output(out: &Output) {
    if out.clear_lines > 0 {
        return;
    }
    if out.new_line {
        println!("{}", out.text);
    } else {
        print!("{}", out.text);
        let _ = io::stdout().flush();
    }
}

fn run(cfg: Config) -> i32 {
    let files = match load_scripts(&cfg.base) {
        Ok(f) => f,
        Err(e) => {
            error!("load scripts: {}", e);
            eprintln!("load scripts: {}", e);
            return 1;
        }
    };
    debug!("loaded {} source files from {}", files.len(), cfg.base);

    let mut vm = match era_runtime::compile(&files) {
        Ok(vm) => vm,
        Err(e) => {
            if cfg.json {
                let res = RunResult { outputs: Vec::new(), error: Some(e.to_string()) };
                println!("{}", serde_json::to_string(&res).unwrap_or_default());
                return 1;
            }
            eprintln!("compile: {}", e);
            return 1;
        }
    };

    if let Err(e) = vm.set_dat_save_format(&cfg.save_fmt) {
        eprintln!("save format: {}", e);
        return 2;
    }
    // Saves default to the script base directory.
    let save_dir = cfg.save_dir.clone().unwrap_or_else(|| cfg.base.clone());
    vm.set_save_dir(save_dir);

    if !cfg.inputs.is_empty() {
        vm.enqueue_input(cfg.inputs.iter().cloned());
    } else if !cfg.json {
        attach_stdin_provider(&mut vm);
    }
    if !cfg.json {
        vm.set_output_hook(Box::new(print_output));
    }

    debug!("running entry {}", cfg.entry);
    let result = match vm.run(&cfg.entry) {
        Ok(outputs) => RunResult { outputs, error: None },
        Err(e) => {
            // Outputs emitted before the failure are still part of the result.
            let res = RunResult {
                outputs: vm.outputs_snapshot(),
                error: Some(e.to_string()),
            };
            if cfg.json {
                println!("{}", serde_json::to_string(&res).unwrap_or_default());
            } else {
                eprintln!("runtime: {}", e);
            }
            return 1;
        }
    };

    if cfg.json {
        println!("{}", serde_json::to_string(&result).unwrap_or_default());
    }
    0
}

fn main() {
    env_logger::init();
    let cfg = parse_args();
    process::exit(run(cfg));
}
