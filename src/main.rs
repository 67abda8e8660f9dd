use std::path::PathBuf;

const USAGE: &str = "usage: signalcast [run|status|print-config|write-config] [--config PATH]";

fn main() {
    let mut args = std::env::args().skip(1);
    let mut command: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--config needs a path\n{}", USAGE);
                    std::process::exit(2);
                }
            },
            "--help" | "-h" => {
                println!("{}", USAGE);
                return;
            }
            _ if command.is_none() && !arg.starts_with('-') => command = Some(arg),
            _ => {
                eprintln!("unexpected argument '{}'\n{}", arg, USAGE);
                std::process::exit(2);
            }
        }
    }

    let result = match command.as_deref().unwrap_or("run") {
        "run" => signalcast_lib::run(config_path),
        "status" => signalcast_lib::print_status(config_path),
        "print-config" => signalcast_lib::print_config(config_path),
        "write-config" => signalcast_lib::write_config(config_path),
        other => {
            eprintln!("unknown command '{}'\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
