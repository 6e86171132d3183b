use std::env;
use std::process;

use evmux::{create_event_loop, Acceptor, Error, LoopKind};

fn print_usage() -> ! {
    eprintln!("Usage: evmux <select|epoll> <port>");
    process::exit(2);
}

fn serve(kind: LoopKind, port: u16) -> Result<(), Error> {
    let mut evloop = create_event_loop(kind)?;
    let acceptor = Acceptor::bind(port)?;

    #[cfg(feature = "log")]
    log::info!(target: "server", "Serving on port {port} over the {kind} backend");

    acceptor.attach(&evloop.handle())?;
    evloop.run();
    Ok(())
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let kind = match args.next().as_deref() {
        Some("select") => LoopKind::Select,
        Some("epoll") => LoopKind::Epoll,
        _ => print_usage(),
    };
    let port = match args.next().and_then(|arg| arg.parse::<u16>().ok()) {
        Some(port) => port,
        None => print_usage(),
    };

    if let Err(err) = serve(kind, port) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
