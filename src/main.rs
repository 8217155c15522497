fn main() {
    if handle_cli_flags() {
        return;
    }

    if let Err(err) = scufftube::run() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("scufftube {}", scufftube::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{}", scufftube::app::USAGE);
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
