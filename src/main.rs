use std::{net::IpAddr, path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use maskinporten_token::{
    authorize_url, AssertionBuilder, CallbackServer, ClaimSet, Config, ConfigInput, Error,
    GrantRequest, Mode, Pkce, Result, SigningIdentity, TokenExchanger,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// PEM certificate chain, optionally bundled with the private key
    #[arg(long)]
    certificate: Option<PathBuf>,

    /// PEM private key (PKCS#1 or PKCS#8), defaults to the certificate file
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// PKCS#12 keystore holding the certificate and private key
    #[arg(long)]
    keystore_path: Option<PathBuf>,

    /// Keystore password
    #[arg(long, env = "KEYSTORE_PASSWORD", hide_env_values = true)]
    keystore_password: Option<String>,

    /// RSA private key in JSON Web Key format
    #[arg(long)]
    jwk_path: Option<PathBuf>,

    /// Key id for the assertion header ("thumbprint" keeps the default)
    #[arg(long)]
    kid: Option<String>,

    /// OAuth client id, used as issuer of the assertion
    #[arg(long)]
    client_id: Option<String>,

    /// Audience of the assertion, usually the issuer URL of the server
    #[arg(long)]
    audience: Option<String>,

    /// Target API for audience restricted tokens
    #[arg(long)]
    resource: Option<String>,

    /// Scopes (comma-separated)
    #[arg(long)]
    scopes: Option<String>,

    /// Token endpoint URL
    #[arg(long)]
    token_endpoint: Option<String>,

    /// Authorization endpoint URL, required in person mode
    #[arg(long)]
    authorize_endpoint: Option<String>,

    /// Lifetime of each assertion in seconds
    #[arg(long)]
    token_ttl: Option<u64>,

    /// Organization number to act on behalf of
    #[arg(long)]
    consumer_org: Option<String>,

    /// Serve tokens over local HTTP
    #[arg(long)]
    server_mode: bool,

    /// Local HTTP port
    #[arg(long)]
    server_port: Option<u16>,

    /// Local HTTP bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Log a person in through the browser and serve their tokens
    #[arg(long)]
    person_mode: bool,

    /// Print only the access token
    #[arg(long)]
    only_token: bool,

    /// Print only the signed assertion, without calling the token endpoint
    #[arg(long)]
    only_grant: bool,

    /// Token endpoint timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl Args {
    fn config_input(&self) -> ConfigInput {
        ConfigInput {
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone(),
            keystore_path: self.keystore_path.clone(),
            keystore_password: self.keystore_password.clone(),
            jwk_path: self.jwk_path.clone(),
            kid: self.kid.clone(),
            client_id: self.client_id.clone(),
            audience: self.audience.clone(),
            resource: self.resource.clone(),
            scopes: self.scopes.clone(),
            token_endpoint: self.token_endpoint.clone(),
            authorize_endpoint: self.authorize_endpoint.clone(),
            token_ttl: self.token_ttl,
            consumer_org: self.consumer_org.clone(),
            server_mode: self.server_mode,
            person_mode: self.person_mode,
            bind: self.bind,
            server_port: self.server_port,
            timeout: self.timeout.map(Duration::from_secs),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout only carries tokens.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            if e.is_fatal() {
                error!("Startup failed: {}", e);
            } else {
                error!("{}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<ExitCode> {
    let config = Config::validate(args.config_input())?;
    let identity = SigningIdentity::load(&config.identity)?;

    match config.mode {
        Mode::OneShot => one_shot(&config, identity, args).await,
        Mode::Server => {
            let server = CallbackServer::from_config(&config, identity, None)?;
            serve(&config, server).await
        }
        Mode::Person => {
            let pkce = Pkce::generate();
            let url = authorize_url(&config, &pkce)?;

            info!("Opening browser for login...");
            info!("If the browser doesn't open, visit: {}", url);
            if let Err(e) = webbrowser::open(url.as_str()) {
                warn!("Failed to open browser: {}", e);
            }

            let server = CallbackServer::from_config(&config, identity, Some(pkce))?;
            serve(&config, server).await
        }
    }
}

async fn one_shot(config: &Config, identity: SigningIdentity, args: &Args) -> Result<ExitCode> {
    let assertions = AssertionBuilder::new(identity, ClaimSet::from_config(config));
    let assertion = assertions.build()?;

    if args.only_grant {
        println!("{assertion}");
        return Ok(ExitCode::SUCCESS);
    }

    let exchanger = TokenExchanger::new(config.token_endpoint.clone(), config.timeout)?;
    let exchange = exchanger
        .exchange(&GrantRequest::JwtBearer { assertion })
        .await;

    if exchange.is_error() {
        eprintln!("{}", exchange.diagnostics());
        return Ok(ExitCode::FAILURE);
    }

    if args.only_token {
        match exchange.access_token() {
            Some(token) => println!("{token}"),
            None => {
                eprintln!("{}", exchange.diagnostics());
                return Err(Error::Transport(
                    "Token response has no access_token".to_string(),
                ));
            }
        }
    } else {
        println!("{}", exchange.body.as_deref().unwrap_or_default());
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(config: &Config, server: CallbackServer) -> Result<ExitCode> {
    let handle = server.serve(config.listen_addr()).await?;
    info!("Press Ctrl-C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
            // In-flight requests are not awaited.
            std::process::exit(0);
        }
        result = handle.handle => {
            result.map_err(|e| Error::Transport(format!("Server task failed: {e}")))??;
            Ok(ExitCode::SUCCESS)
        }
    }
}
