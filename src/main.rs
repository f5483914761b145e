use session_prebake::{cli, env_loader, logging};

fn main() {
    let dotenv = env_loader::load_dotenv();
    logging::init();
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    if let Err(err) = cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
