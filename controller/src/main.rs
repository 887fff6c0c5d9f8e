use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use controller::{
    Error,
    executor::ProcessExecutor,
    manager::HookManager,
    runner::HookRunner,
    webhooks::{WebhookManagers, WebhookSettings},
};
use webhook::{BoxError, State};

/// KINDS are the webhook servers the operator runs.
const KINDS: [&str; 3] = ["validating", "mutating", "conversion"];

fn main() {
    use clap::{Command, crate_authors, crate_description, crate_name, crate_version};
    use std::process;

    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([
            Command::new("run")
                .about("load hooks and serve their webhooks")
                .args(run_args()),
            Command::new("cleanup")
                .about("load hooks and delete the webhook configuration objects they declare")
                .args(run_args()),
            Command::new("config-schema").about("print the JSON schema of the hook configuration"),
        ]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some((name @ ("run" | "cleanup"), m)) => match Args::try_from(m) {
            Ok(args) => startup(args, name == "cleanup"),
            Err(e) => Err(Error::from(e)),
        },
        Some(("config-schema", _)) => config_schema(),
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

fn run_args() -> Vec<clap::Arg> {
    use clap::{Arg, ValueHint};

    let mut args = vec![
        Arg::new("hooks_dir")
            .long("hooks-dir")
            .env("HOOKS_DIR")
            .help("directory to discover hooks in")
            .value_hint(ValueHint::DirPath)
            .default_value("/hooks"),
        Arg::new("tmp_dir")
            .long("tmp-dir")
            .env("TMP_DIR")
            .help("directory for files exchanged with hooks")
            .value_hint(ValueHint::DirPath)
            .default_value(std::env::temp_dir().join("hook-operator").into_os_string()),
        Arg::new("namespace")
            .long("namespace")
            .env("POD_NAMESPACE")
            .help("namespace of the services fronting the webhook servers")
            .default_value("default"),
        Arg::new("introspection_address")
            .long("introspection-bind-address")
            .env("INTROSPECTION_BIND_ADDRESS")
            .help("address to bind for the HTTP introspection server")
            .default_value("[::]:9115"),
    ];
    args.extend(webhook_args("validating", 9680));
    args.extend(webhook_args("mutating", 9682));
    args.extend(webhook_args("conversion", 9681));
    args
}

fn webhook_args(kind: &'static str, port: u16) -> Vec<clap::Arg> {
    use clap::{Arg, ValueHint};

    let env = kind.to_uppercase();
    let mut args = vec![
        Arg::new(format!("{kind}_address"))
            .long(format!("{kind}-webhook-bind-address"))
            .env(format!("{env}_WEBHOOK_ADDRESS"))
            .help(format!("address to bind for the {kind} webhook server"))
            .long_help(format!(
                "Address to bind for the {kind} webhook server.\n\
                 If there's a TLS certificate and key named `tls.crt` and `tls.key` in \
                 `--{kind}-webhook-cert-dir` then HTTPS will be served."
            ))
            .default_value(format!("[::]:{port}")),
        Arg::new(format!("{kind}_service_name"))
            .long(format!("{kind}-webhook-service-name"))
            .env(format!("{env}_WEBHOOK_SERVICE_NAME"))
            .help(format!("name of the service fronting the {kind} webhook server"))
            .default_value(format!("hook-operator-{kind}")),
        Arg::new(format!("{kind}_cert_dir"))
            .long(format!("{kind}-webhook-cert-dir"))
            .env(format!("{env}_WEBHOOK_CERT_DIR"))
            .help("directory containing TLS cert+key pair")
            .value_hint(ValueHint::DirPath)
            .default_value(format!("/{kind}-certs")),
        Arg::new(format!("{kind}_ca"))
            .long(format!("{kind}-webhook-ca"))
            .env(format!("{env}_WEBHOOK_CA"))
            .help("file containing the CA bundle the API server verifies the server with")
            .long_help("File containing the CA bundle. Defaults to `ca.crt` inside the cert dir.")
            .value_hint(ValueHint::FilePath),
        Arg::new(format!("{kind}_client_ca"))
            .long(format!("{kind}-webhook-client-ca"))
            .env(format!("{env}_WEBHOOK_CLIENT_CA"))
            .help("file containing CA certificates clients must present a certificate signed by")
            .long_help(
                "File containing CA certificates. When given, only clients presenting a \
                 certificate signed by one of them are served. May be repeated.",
            )
            .action(clap::ArgAction::Append)
            .value_delimiter(',')
            .value_hint(ValueHint::FilePath),
    ];
    if kind != "conversion" {
        args.push(
            Arg::new(format!("{kind}_configuration_name"))
                .long(format!("{kind}-webhook-configuration-name"))
                .env(format!("{env}_WEBHOOK_CONFIGURATION_NAME"))
                .help(format!("name of the {kind} webhook configuration object"))
                .default_value("hook-operator-hooks"),
        );
    }
    args
}

fn config_schema() -> controller::Result<()> {
    let schema = schemars::schema_for!(api::HookConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

struct ServerArgs {
    address: SocketAddr,
    service_name: String,
    configuration_name: String,
    cert_dir: PathBuf,
    ca: PathBuf,
    client_ca: Vec<PathBuf>,
}

impl ServerArgs {
    fn from_matches(m: &clap::ArgMatches, kind: &str) -> Result<Self, std::net::AddrParseError> {
        let cert_dir: PathBuf = arg(m, &format!("{kind}_cert_dir")).into();
        let ca = m
            .try_get_one::<String>(&format!("{kind}_ca"))
            .ok()
            .flatten()
            .map(PathBuf::from)
            .unwrap_or_else(|| cert_dir.join("ca.crt"));
        Ok(Self {
            address: arg(m, &format!("{kind}_address")).parse()?,
            service_name: arg(m, &format!("{kind}_service_name")),
            configuration_name: m
                .try_get_one::<String>(&format!("{kind}_configuration_name"))
                .ok()
                .flatten()
                .cloned()
                .unwrap_or_default(),
            cert_dir,
            ca,
            client_ca: m
                .get_many::<String>(&format!("{kind}_client_ca"))
                .map(|v| v.map(PathBuf::from).collect())
                .unwrap_or_default(),
        })
    }

    async fn settings(&self, namespace: &str) -> WebhookSettings {
        let ca_bundle = match tokio::fs::read(&self.ca).await {
            Ok(b) => b,
            Err(err) => {
                warn!(ca = ?self.ca, error = %err, "unable to read CA bundle, leaving it unset");
                Vec::new()
            }
        };
        WebhookSettings {
            service_name: self.service_name.clone(),
            namespace: namespace.to_string(),
            configuration_name: self.configuration_name.clone(),
            ca_bundle,
        }
    }
}

struct Args {
    hooks_dir: PathBuf,
    tmp_dir: PathBuf,
    namespace: String,
    introspection_address: SocketAddr,
    validating: ServerArgs,
    mutating: ServerArgs,
    conversion: ServerArgs,
}

fn arg(m: &clap::ArgMatches, id: &str) -> String {
    m.get_one::<String>(id).cloned().unwrap_or_default()
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            hooks_dir: arg(m, "hooks_dir").into(),
            tmp_dir: arg(m, "tmp_dir").into(),
            namespace: arg(m, "namespace"),
            introspection_address: arg(m, "introspection_address").parse()?,
            validating: ServerArgs::from_matches(m, KINDS[0])?,
            mutating: ServerArgs::from_matches(m, KINDS[1])?,
            conversion: ServerArgs::from_matches(m, KINDS[2])?,
        })
    }
}

fn startup(args: Args, cleanup: bool) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
        controller::metrics::describe();
    });
    let stop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        stop.cancel();
    });
    if cleanup {
        rt.block_on(cleanup_configurations(args))
    } else {
        rt.block_on(run(args, token))
    }
}

async fn load(args: &Args) -> controller::Result<HookManager> {
    let managers = WebhookManagers::new(
        args.validating.settings(&args.namespace).await,
        args.mutating.settings(&args.namespace).await,
        args.conversion.settings(&args.namespace).await,
    );
    // Hooks run from the hooks dir, so every path handed to them must be absolute.
    let hooks_dir = std::path::absolute(&args.hooks_dir)?;
    let mut manager = HookManager::new(
        Arc::new(ProcessExecutor {
            dir: Some(hooks_dir.clone()),
        }),
        &hooks_dir,
        managers,
    );
    manager.init().await?;
    info!(hooks = manager.hook_names().len(), "hooks loaded");
    Ok(manager)
}

async fn cleanup_configurations(args: Args) -> controller::Result<()> {
    let mut manager = load(&args).await?;
    manager.disable_bindings();
    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config)?.build();
    manager.webhooks().delete_configurations(client).await?;
    info!("webhook configurations deleted");
    Ok(())
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;

    let tmp_dir = std::path::absolute(&args.tmp_dir)?;
    let manager = load(&args).await?;
    let startup = manager.get_hooks_in_order(api::BindingType::OnStartup)?;
    debug!(?startup, "onStartup order");
    for m in manager.kube_monitors() {
        debug!(monitor_id = %m.monitor_id, kind = %m.kind, "kubernetes binding declared");
    }
    for c in manager.crontabs() {
        debug!(crontab = c, "schedule binding declared");
    }

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config)?.build();
    manager.webhooks().create_configurations(client).await?;
    info!("webhook configurations in sync");

    let manager = Arc::new(manager);
    let runner = Arc::new(HookRunner::new(Arc::clone(&manager), &tmp_dir));

    let r = Arc::clone(&runner);
    let validating = webhook::validating_app(State::new(move |ev: api::ValidatingEvent| {
        let r = Arc::clone(&r);
        async move { r.validate(ev).await.map_err(BoxError::from) }.boxed()
    }));
    let r = Arc::clone(&runner);
    let mutating = webhook::mutating_app(State::new(move |ev: api::MutatingEvent| {
        let r = Arc::clone(&r);
        async move { r.mutate(ev).await.map_err(BoxError::from) }.boxed()
    }));
    let r = Arc::clone(&runner);
    let conversion = webhook::conversion_app(State::new(move |call: webhook::ConversionCall| {
        let r = Arc::clone(&r);
        async move {
            r.convert(
                &call.crd_name,
                &call.request.desired_api_version,
                call.request.objects,
            )
            .await
            .map_err(BoxError::from)
        }
        .boxed()
    }));

    let mut servers = task::JoinSet::new();
    for (kind, app, srv) in [
        (KINDS[0], validating, &args.validating),
        (KINDS[1], mutating, &args.mutating),
        (KINDS[2], conversion, &args.conversion),
    ] {
        servers.spawn(serve(
            kind,
            srv.address,
            srv.cert_dir.join("tls.crt"),
            srv.cert_dir.join("tls.key"),
            srv.client_ca.clone(),
            app,
            token.clone(),
        ));
    }
    while let Some(res) = servers.join_next().await {
        match res {
            Err(e) => error!("error starting webhook server: {e}"),
            Ok(Err(e)) => {
                error!("error from webhook server: {e}");
                token.cancel();
            }
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

async fn serve<Pa, Pb>(
    kind: &'static str,
    addr: SocketAddr,
    certfile: Pa,
    keyfile: Pb,
    client_ca: Vec<PathBuf>,
    app: axum::Router,
    cancel: CancellationToken,
) -> controller::Result<()>
where
    Pa: AsRef<Path>,
    Pb: AsRef<Path>,
{
    use axum_server::Handle;

    let certfile = certfile.as_ref();
    let keyfile = keyfile.as_ref();
    let handle = Handle::new();
    let h = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        h.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    let res = if certfile.exists() && keyfile.exists() {
        let config = controller::tls::acceptor(certfile, keyfile, &client_ca)?;
        info!(kind, %addr, client_auth = !client_ca.is_empty(), "started webhook server with TLS");
        axum_server::bind_openssl(addr, config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
    } else {
        warn!(kind, %addr, "no TLS certificate found, serving plain HTTP");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
    };
    res.map_err(Error::from)
}
