use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use kpxc_client::paths::config_path;
use kpxc_client::{
    Client, ClientConfig, ClientEvent, ClientState, CryptoInit, DatabaseRegistry, Entry, FileRegistry, LoginQuery,
    MemoryRegistry,
};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kpxc-cli")]
#[command(about = "Talk to a running KeePassXC through keepassxc-proxy", long_about = None)]
struct Cli {
    /// Proxy executable (overrides config and KPXC_PROXY)
    #[arg(long)]
    proxy: Option<String>,

    /// Config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Association registry file
    #[arg(long, conflicts_with = "ephemeral")]
    registry: Option<PathBuf>,

    /// Keep associations in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Follow KeePassXC when another database gets opened
    #[arg(long)]
    allow_database_change: bool,

    /// Do not ask KeePassXC to prompt for unlocking
    #[arg(long)]
    no_trigger_unlock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Show the database the session got bound to
    Status,

    /// Generate a password with KeePassXC's generator
    Generate,

    /// List logins stored for a URL
    Logins {
        url: String,

        #[arg(long)]
        submit_url: Option<String>,

        /// Include HTTP basic-auth entries
        #[arg(long)]
        http_auth: bool,

        /// Search every associated database
        #[arg(long)]
        all_databases: bool,

        #[arg(long)]
        show_passwords: bool,
    },

    /// Store a login; a password is generated when none is given
    Add {
        url: String,
        username: String,

        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        submit_url: Option<String>,
    },

    /// Lock the open database
    Lock,
}

/// Runs one command over the session and records how it went.
struct Runner {
    command: Commands,
    started: bool,
    finished: bool,
    failure: Option<anyhow::Error>,
}

impl Runner {
    fn new(command: Commands) -> Self {
        Self {
            command,
            started: false,
            finished: false,
            failure: None,
        }
    }

    fn start(&mut self, client: &mut Client, hash: &[u8]) {
        if self.started {
            return;
        }
        self.started = true;
        match &self.command {
            Commands::Status => {
                println!("database {}", hex::encode(hash));
                self.finish(client);
            }
            Commands::Generate => client.generate_password(),
            Commands::Logins {
                url,
                submit_url,
                http_auth,
                all_databases,
                ..
            } => {
                let mut query = LoginQuery::new(url)
                    .http_auth(*http_auth)
                    .search_all_databases(*all_databases);
                if let Some(submit_url) = submit_url {
                    query = query.submit_url(submit_url);
                }
                client.get_logins(&query);
            }
            Commands::Add {
                url,
                username,
                password: Some(password),
                submit_url,
            } => {
                client.add_login(url, &Entry::new(username, password), submit_url.as_deref());
            }
            Commands::Add { password: None, .. } => client.generate_password(),
            Commands::Lock => client.close_database(),
        }
    }

    fn handle(&mut self, client: &mut Client, event: &ClientEvent) {
        match event {
            ClientEvent::DatabaseOpened(hash) => self.start(client, hash),
            ClientEvent::PasswordsGenerated(passwords) => match &self.command {
                Commands::Generate => {
                    for password in passwords {
                        println!("{password}");
                    }
                    self.finish(client);
                }
                Commands::Add {
                    url,
                    username,
                    submit_url,
                    ..
                } => match passwords.first() {
                    Some(password) => {
                        println!("generated password: {password}");
                        client.add_login(url, &Entry::new(username, password), submit_url.as_deref());
                    }
                    None => self.fail(client, anyhow!("KeePassXC returned no password")),
                },
                _ => {}
            },
            ClientEvent::LoginsReceived(entries) => {
                let show = matches!(self.command, Commands::Logins { show_passwords: true, .. });
                for entry in entries {
                    let password = if show { entry.password() } else { "********" };
                    println!("{}\t{}\t{}", entry.title(), entry.username(), password);
                }
                self.finish(client);
            }
            ClientEvent::LoginAdded => {
                println!("login stored");
                self.finish(client);
            }
            ClientEvent::DatabaseClosed => {
                if matches!(self.command, Commands::Lock) {
                    println!("database locked");
                    self.finish(client);
                }
            }
            ClientEvent::Error(error) => {
                let err = anyhow!("{} (code {:#x})", error.error, error.error.code());
                if error.unrecoverable || self.started {
                    self.fail(client, err);
                } else {
                    eprintln!("warning: {err}");
                }
            }
            ClientEvent::StateChanged(state) => debug!(?state, "session state"),
            _ => {}
        }
    }

    fn fail(&mut self, client: &mut Client, err: anyhow::Error) {
        self.failure.get_or_insert(err);
        self.finish(client);
    }

    fn finish(&mut self, client: &mut Client) {
        if self.finished {
            return;
        }
        self.finished = true;
        if client.state() != ClientState::Disconnected {
            client.disconnect();
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match cli.config.clone().or_else(config_path) {
        Some(path) => ClientConfig::load_or_default(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    }
    .with_env_overrides();

    if let Some(proxy) = &cli.proxy {
        config.proxy_program = proxy.clone();
    }
    if cli.allow_database_change {
        config.options.allow_database_change = true;
    }
    if cli.no_trigger_unlock {
        config.options.trigger_unlock = false;
    }
    config.options.open_on_connect = true;
    Ok(config)
}

fn open_registry(cli: &Cli) -> Result<Box<dyn DatabaseRegistry>> {
    if cli.ephemeral {
        return Ok(Box::new(MemoryRegistry::new()));
    }
    let path = cli
        .registry
        .clone()
        .or_else(FileRegistry::default_path)
        .ok_or_else(|| anyhow!("cannot determine registry location, pass --registry"))?;
    let registry = FileRegistry::open(&path).with_context(|| format!("opening registry {}", path.display()))?;
    Ok(Box::new(registry))
}

enum Input {
    Event(Option<ClientEvent>),
    Interrupt,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let registry = open_registry(&cli)?;
    let init = CryptoInit::init()?;

    let mut client = Client::new(init, &config, registry);
    let mut runner = Runner::new(cli.command.clone());
    info!(proxy = %config.proxy_program, "connecting");
    client.connect();

    loop {
        let input = tokio::select! {
            event = client.next_event() => Input::Event(event),
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };
        match input {
            Input::Event(None) | Input::Event(Some(ClientEvent::Disconnected)) => break,
            Input::Event(Some(event)) => runner.handle(&mut client, &event),
            Input::Interrupt => {
                info!("interrupted, disconnecting");
                runner.failure.get_or_insert_with(|| anyhow!("interrupted"));
                runner.finished = true;
                client.disconnect();
            }
        }
    }

    match runner.failure {
        Some(err) => Err(err),
        None if !runner.finished => Err(anyhow!("disconnected before the command completed")),
        None => Ok(()),
    }
}
