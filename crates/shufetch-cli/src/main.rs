use shufetch_core::logging;

mod cli;

fn main() {
    if let Err(e) = logging::init_logging() {
        eprintln!("shufetch: log file unavailable ({}), using stderr", e);
        logging::init_logging_stderr();
    }

    if let Err(err) = cli::run_from_args() {
        eprintln!("shufetch error: {:#}", err);
        std::process::exit(1);
    }
}
