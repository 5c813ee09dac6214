use std::path::PathBuf;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

use workspaces_operator::telemetry::{self, LogFormat};
use workspaces_operator::{controllers, webhooks, Metrics, Settings, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Expose Workspaces through Istio VirtualServices
    #[arg(long, env = "USE_LAYER7_ROUTING")]
    use_layer7_routing: bool,

    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    #[arg(long, env = "ISTIO_GATEWAY", default_value = "kubeflow/kubeflow-gateway")]
    istio_gateway: String,

    #[arg(long, env = "ISTIO_HOSTS", default_value = "*", value_delimiter = ',')]
    istio_hosts: Vec<String>,

    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:9443")]
    webhook_bind_address: String,

    /// Directory holding tls.crt and tls.key for the admission server
    #[arg(long, env = "WEBHOOK_CERT_DIR", value_name = "DIR")]
    webhook_cert_dir: Option<PathBuf>,

    #[arg(long, env = "DISABLE_WEBHOOKS")]
    disable_webhooks: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

impl Arguments {
    fn settings(&self) -> Settings {
        Settings {
            use_layer7_routing: self.use_layer7_routing,
            cluster_domain: self.cluster_domain.clone(),
            istio_gateway: self.istio_gateway.clone(),
            istio_hosts: self.istio_hosts.clone(),
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format);

    let state = State::new(args.settings());
    let metrics_handle = Metrics::default().register(&state.registry)?;
    let client = kube::Client::try_default().await?;

    // Both controllers share one client and one set of metrics
    let workspace_controller =
        controllers::workspace::run(client.clone(), metrics_handle.clone(), state.clone());
    let workspacekind_controller =
        controllers::workspacekind::run(client.clone(), metrics_handle, state.clone());

    let metrics_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.metrics_bind_address)?
    .shutdown_timeout(5)
    .run();

    let webhook_server = match (&args.webhook_cert_dir, args.disable_webhooks) {
        (Some(cert_dir), false) => {
            let tls = webhooks::tls_config(cert_dir)?;
            let validators = webhooks::Validators::new(client);
            info!("serving admission webhooks on {}", args.webhook_bind_address);
            Some(
                HttpServer::new(move || {
                    App::new()
                        .app_data(Data::new(validators.clone()))
                        .wrap(middleware::Logger::default())
                        .configure(webhooks::configure)
                })
                .bind_rustls_0_22(&args.webhook_bind_address, tls)?
                .shutdown_timeout(5)
                .run(),
            )
        }
        _ => {
            info!("admission webhooks are disabled");
            None
        }
    };
    let webhook_server = async move {
        match webhook_server {
            Some(server) => server.await,
            None => Ok(()),
        }
    };

    // Every runtime implements graceful shutdown, so poll until all are done
    let (_, _, metrics_result, webhook_result) = tokio::join!(
        workspace_controller,
        workspacekind_controller,
        metrics_server,
        webhook_server
    );
    metrics_result?;
    webhook_result?;
    Ok(())
}
