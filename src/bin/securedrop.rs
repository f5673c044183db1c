#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Interactive SecureDrop client shell

use clap::Parser;
use securedrop::client::password_meets_policy;
use securedrop::store::validate_email;
use securedrop::{Client, ClientConfig, Error, Progress, Receiver, RegisteredEmails};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "securedrop")]
#[command(about = "SecureDrop LAN file exchange client")]
struct Args {
    /// Coordinator hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Coordinator port
    #[arg(long)]
    port: Option<u16>,

    /// Local registered-email cache file
    #[arg(long)]
    filename: Option<PathBuf>,

    /// PEM file with the TLS identity used when receiving files
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

type InputLines = Lines<BufReader<Stdin>>;

struct Shell {
    client: Client,
    lines: InputLines,
    acceptor: Option<TlsAcceptor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    let filter = if args.debug {
        EnvFilter::new("securedrop=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ClientConfig::from_env()?;
    if let Some(hostname) = args.hostname {
        config.hostname = hostname;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(filename) = args.filename {
        config.state_path = filename;
    }
    if let Some(cert) = args.cert {
        config.cert_path = cert;
    }

    // Receiving needs a TLS identity for the ephemeral listener; the
    // shell still works without one for everything else.
    let acceptor = match securedrop::tls::acceptor_from_pem(&config.cert_path) {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            tracing::warn!("No TLS identity loaded ({e}); receiving files is disabled");
            None
        }
    };

    let mut cache = RegisteredEmails::load(&config.state_path);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut client = Client::connect(config).await?;

    login_or_register(&mut client, &mut lines, &mut cache).await?;

    let mut shell = Shell {
        client,
        lines,
        acceptor,
    };
    shell.run().await?;
    println!("Exiting SecureDrop");
    Ok(())
}

async fn prompt(lines: &mut InputLines, text: &str) -> anyhow::Result<String> {
    print!("{text}");
    std::io::stdout().flush()?;
    let line = lines.next_line().await?.unwrap_or_default();
    Ok(line.trim().to_string())
}

async fn login_or_register(
    client: &mut Client,
    lines: &mut InputLines,
    cache: &mut RegisteredEmails,
) -> anyhow::Result<()> {
    if cache.is_empty() {
        let decision = prompt(
            lines,
            "No users are registered with this client.\nDo you want to register a new user (y/n)? ",
        )
        .await?;
        if decision != "y" {
            anyhow::bail!("You must register a user before using securedrop");
        }

        let name = prompt(lines, "Enter Full Name: ").await?;
        let email = prompt(lines, "Enter Email Address: ").await?;
        if name.is_empty() || !validate_email(&email) {
            anyhow::bail!("Invalid input");
        }
        let password = prompt(lines, "Enter Password: ").await?;
        let again = prompt(lines, "Re-enter Password: ").await?;
        if password != again {
            anyhow::bail!("The two entered passwords don't match!");
        }
        if !password_meets_policy(&password) {
            anyhow::bail!("Password is too short! Password must be at least 12 characters");
        }

        let message = client.register(&name, &email, &password).await?;
        if !message.is_empty() {
            anyhow::bail!(message);
        }
        cache.add(&email)?;
        println!("User Registered.");
    } else {
        let email = prompt(lines, "Enter Email Address: ").await?;
        let password = prompt(lines, "Enter Password: ").await?;
        let message = client.login(&email, &password).await?;
        if !message.is_empty() {
            anyhow::bail!(message);
        }
    }

    println!("Welcome to SecureDrop");
    println!("Type \"help\" For Commands");
    Ok(())
}

impl Shell {
    /// The command loop. Idles on stdin with a 1-second timeout,
    /// polling for incoming transfer requests between inputs and
    /// after every command.
    async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            print!("secure_drop> ");
            std::io::stdout().flush()?;

            let line = loop {
                let input = tokio::select! {
                    line = self.lines.next_line() => Some(line?),
                    () = tokio::time::sleep(Duration::from_secs(1)) => None,
                };
                match input {
                    Some(line) => break line,
                    None => {
                        if self.check_incoming().await? {
                            print!("secure_drop> ");
                            std::io::stdout().flush()?;
                        }
                    }
                }
            };
            let Some(line) = line else {
                break;
            };

            match line.trim() {
                "" => {}
                "help" => {
                    println!("\"add\"  \t-> Add a new contact");
                    println!("\"list\"  \t-> List all online contacts");
                    println!("\"send\"  \t-> Transfer file to contact");
                    println!("\"exit\"  \t-> Exit SecureDrop");
                }
                "add" => self.cmd_add().await?,
                "list" => self.cmd_list().await?,
                "send" => self.cmd_send().await?,
                "exit" => break,
                other => {
                    println!("Unknown command \"{other}\". Type \"help\" for commands.");
                }
            }

            self.check_incoming().await?;
        }
        Ok(())
    }

    async fn cmd_add(&mut self) -> anyhow::Result<()> {
        let name = prompt(&mut self.lines, "Enter Full Name: ").await?;
        let email = prompt(&mut self.lines, "Enter Email Address: ").await?;
        if name.is_empty() || email.is_empty() {
            println!("Name and email must both be non-empty.");
            return Ok(());
        }
        let message = self.client.add_contact(&name, &email).await?;
        if message.is_empty() {
            println!("Contact added.");
        } else {
            println!("{message}");
        }
        Ok(())
    }

    async fn cmd_list(&mut self) -> anyhow::Result<()> {
        let contacts = self.client.list_contacts().await?;
        if contacts.is_empty() {
            println!("No contacts online.");
        } else {
            for (email, name) in contacts {
                println!("{email}  \t{name}");
            }
        }
        Ok(())
    }

    async fn cmd_send(&mut self) -> anyhow::Result<()> {
        let recipient = prompt(&mut self.lines, "Enter recipient email: ").await?;
        if !validate_email(&recipient) {
            println!("Email address is invalid.");
            return Ok(());
        }
        let path = PathBuf::from(prompt(&mut self.lines, "Enter file path: ").await?);
        if !path.is_file() {
            println!("{} is not a readable file.", path.display());
            return Ok(());
        }

        let progress = Progress::new();
        let printer = spawn_progress_printer(&progress, "Sent");

        let result = tokio::select! {
            result = self.client.send_file(&recipient, &path, &progress) => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };
        printer.abort();
        println!();

        match result {
            Some(Ok(())) => println!("Transfer complete."),
            Some(Err(Error::Transfer(message))) => println!("{message}"),
            Some(Err(e)) => return Err(e.into()),
            None => println!("Transfer cancelled."),
        }
        Ok(())
    }

    /// Poll once; if requests are pending, walk the user through
    /// accepting one (spawning an independent receiver task) or
    /// denying them all. Returns whether anything was shown.
    async fn check_incoming(&mut self) -> anyhow::Result<bool> {
        let requests = self.client.poll_requests().await?;
        if requests.is_empty() {
            return Ok(false);
        }

        println!();
        for (sender, info) in &requests {
            println!(
                "Incoming file from {sender}: {} ({} bytes)",
                info.name, info.size
            );
        }

        let choice = prompt(
            &mut self.lines,
            "Enter sender email to accept (empty to deny all): ",
        )
        .await?;
        if choice.is_empty() {
            self.client.deny_all().await?;
            println!("All pending requests denied.");
            return Ok(true);
        }
        let Some(info) = requests.get(&choice) else {
            println!("No pending request from {choice}.");
            return Ok(true);
        };

        let Some(acceptor) = self.acceptor.clone() else {
            println!("Cannot receive: no TLS identity is loaded.");
            return Ok(true);
        };
        let out_dir = prompt(&mut self.lines, "Enter output directory: ").await?;
        let out_dir = if out_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(out_dir)
        };
        let out_path = out_dir.join(&info.name);
        if out_path.exists() {
            println!("{} already exists.", out_path.display());
            return Ok(true);
        }

        let token = match self.client.accept_transfer(&choice).await {
            Ok(token) => token,
            Err(Error::Transfer(message)) => {
                println!("{message}");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        let progress = Progress::new();
        let receiver = Receiver::bind(acceptor, token, out_dir, progress.clone()).await?;
        self.client.send_port(receiver.port()).await?;

        // Independent task so the control session stays responsive
        // during a long transfer.
        let name = info.name.clone();
        tokio::spawn(async move {
            match receiver.run().await {
                Ok(path) => println!("\nReceived {name} -> {}", path.display()),
                Err(e) => println!("\nTransfer of {name} failed: {e}"),
            }
        });
        println!("Receiving in the background...");
        Ok(true)
    }
}

fn spawn_progress_printer(
    progress: &std::sync::Arc<Progress>,
    verb: &'static str,
) -> tokio::task::JoinHandle<()> {
    let progress = std::sync::Arc::clone(progress);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let (done, total) = progress.snapshot();
            if total > 0 {
                print!("\r{verb} {done}/{total} chunks");
                let _ = std::io::stdout().flush();
            }
        }
    })
}
