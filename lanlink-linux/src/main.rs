// lanlink daemon: chat and file transfer over raw Ethernet frames on one
// broadcast domain.

mod config;
mod node;
mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lanlink_core::{Event, EventKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn print_help() {
    println!("lanlink {} — link-layer chat and file transfer daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    lanlink-linux [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Speaks the lanlink protocol (EtherType 0x88B5) directly over raw");
    println!("    Ethernet frames: peers on the same broadcast domain discover each");
    println!("    other, exchange text messages and transfer files. No IP involved.");
    println!();
    println!("    Raw link-layer sockets need CAP_NET_RAW; run as root or grant the");
    println!("    capability to the binary.");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM (broadcasts GOODBYE on the way out).");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/lanlink/config.toml");
    println!("      /etc/lanlink/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      interface = \"eth0\"");
    println!("      display_name = \"workshop-pc\"");
    println!("      download_dir = \"received_files\"");
    println!();
    println!("      [engine]");
    println!("      hello_interval = 5");
    println!("      file_window = 16");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    LANLINK_INTERFACE       Interface to bind (default: eth0)");
    println!("    LANLINK_DISPLAY_NAME    Name announced to peers");
    println!("    LANLINK_DOWNLOAD_DIR    Where received files are stored");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanlink {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("lanlink: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    let cfg = config::load();
    std::fs::create_dir_all(&cfg.download_dir)?;

    let node = node::Node::start(&cfg.interface, cfg.display_name.clone(), cfg.engine.clone())?;
    println!(
        "lanlink {} on {} ({})",
        VERSION,
        cfg.interface,
        node.local_mac()
    );

    let events = node.events();
    events.register(EventKind::PeerUp, "console", |event| {
        if let Event::PeerUp { mac, display_name } = event {
            match display_name {
                Some(name) => println!("peer up: {} ({})", mac, name),
                None => println!("peer up: {}", mac),
            }
        }
    });
    events.register(EventKind::PeerDown, "console", |event| {
        if let Event::PeerDown { mac } = event {
            println!("peer down: {}", mac);
        }
    });
    events.register(EventKind::MessageReceived, "console", |event| {
        if let Event::MessageReceived { source, text, .. } = event {
            println!("<{}> {}", source, text);
        }
    });
    events.register(EventKind::FileOffer, "console", |event| {
        if let Event::FileOffer {
            source,
            filename,
            file_size,
            decision,
            ..
        } = event
        {
            println!("accepting {} ({} bytes) from {}", filename, file_size, source);
            decision.accept();
        }
    });
    let download_dir = cfg.download_dir.clone();
    events.register(EventKind::FileReceived, "console", move |event| {
        if let Event::FileReceived {
            source,
            filename,
            data,
            digest_ok,
        } = event
        {
            if !digest_ok {
                eprintln!("transfer of {} from {} failed verification", filename, source);
                return;
            }
            let path = download_dir.join(sanitize_filename(filename));
            match std::fs::write(&path, data) {
                Ok(()) => println!(
                    "received {} ({} bytes) -> {}",
                    filename,
                    data.len(),
                    path.display()
                ),
                Err(err) => eprintln!("could not store {}: {}", filename, err),
            }
        }
    });
    events.register(EventKind::FileSendDone, "console", |event| {
        if let Event::FileSendDone { filename, dest, .. } = event {
            println!("sent {} to {}", filename, dest);
        }
    });
    events.register(EventKind::FileSendFailed, "console", |event| {
        if let Event::FileSendFailed {
            filename,
            dest,
            reason,
            ..
        } = event
        {
            eprintln!("sending {} to {} failed: {}", filename, dest, reason);
        }
    });
    events.register(EventKind::TransportError, "console", |event| {
        if let Event::TransportError { detail } = event {
            eprintln!("transport error: {}", detail);
        }
    });

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    println!("shutting down");
    node.shutdown();
    Ok(())
}

/// Reduce an offered filename to something safe to create locally: keep
/// alphanumerics plus `.`, `_`, `-`; anything path-like is stripped.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "file.bin".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::sanitize_filename;

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_filename("informe.pdf"), "informe.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_filename("a b!c.txt"), "abc.txt");
        assert_eq!(sanitize_filename(".."), "file.bin");
        assert_eq!(sanitize_filename("///"), "file.bin");
    }
}
