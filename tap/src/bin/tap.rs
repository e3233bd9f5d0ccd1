use clap::{App, Arg, ArgMatches};
use color_eyre::eyre::{eyre, Report, WrapErr};
use std::path::Path;
use tap::id::Tid;
use tap::manifest::Manifest;
use tap::node::Node;
use tap::{run, IPC_PORT, SERVER_PORT};

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let matches = parse_args();

    let port = parse_port(matches.value_of("port"), SERVER_PORT)?;
    let manifest_file = matches
        .value_of("manifest")
        .unwrap_or("./manifest.json")
        .to_string();

    // commands, codebase globs and pushed paths are manifest-dir relative
    let manifest_dir = Path::new(&manifest_file)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf);
    if let Some(dir) = manifest_dir {
        std::env::set_current_dir(&dir)
            .wrap_err_with(|| format!("entering manifest dir {:?}", dir))?;
    }
    let manifest_file = Path::new(&manifest_file)
        .file_name()
        .map(|name| Path::new(".").join(name))
        .ok_or_else(|| eyre!("manifest path has no file name"))?;

    if matches.is_present("client") {
        let addr = matches.value_of("client").unwrap_or("").to_string();
        let manifest = Manifest::load(&manifest_file, "")?;
        let name = match matches.value_of("name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ if !manifest.name.is_empty() => manifest.name.clone(),
            _ => format!("client-{}", Tid::random()),
        };
        let node =
            Node::new(name.clone(), manifest, &manifest_file, name);
        run::slave(&addr, port, node).await
    } else if matches.is_present("server") {
        let ipc_port = parse_port(matches.value_of("ipc-port"), IPC_PORT)?;
        // the master serves without a manifest if there is none on disk
        let manifest =
            Manifest::load(&manifest_file, "").unwrap_or_default();
        let name = manifest.name.clone();
        let node =
            Node::new(name, manifest, &manifest_file, String::new());
        run::master(port, ipc_port, node).await
    } else {
        Err(eyre!("Please specify client mode or server mode."))
    }
}

fn parse_args() -> ArgMatches<'static> {
    App::new("tap")
        .version("0.1")
        .about("All-in-one cluster control tap.")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("server port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("manifest")
                .long("manifest")
                .value_name("FILE")
                .help("path to the manifest file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server")
                .short("s")
                .long("server")
                .help("run in server mode"),
        )
        .arg(
            Arg::with_name("ipc-port")
                .long("ipc-port")
                .value_name("PORT")
                .help("external IPC port (server mode)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("client")
                .short("c")
                .long("client")
                .value_name("ADDR")
                .help(
                    "run in client mode; without an address the master \
                     is auto-detected on the local network",
                )
                .takes_value(true)
                .min_values(0)
                .max_values(1),
        )
        .arg(
            Arg::with_name("name")
                .short("n")
                .long("name")
                .value_name("NAME")
                .help("override the manifest client name")
                .takes_value(true),
        )
        .get_matches()
}

fn parse_port(port: Option<&str>, default: u16) -> Result<u16, Report> {
    match port {
        Some(port) => port
            .parse()
            .wrap_err_with(|| format!("invalid port {:?}", port)),
        None => Ok(default),
    }
}
