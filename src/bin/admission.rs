use clap::Parser;
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
        DynamicObject,
    },
    Client,
};
use operator::admission;
use std::convert::Infallible;
use tracing::*;
use warp::{reply, Filter, Reply};

#[derive(Parser, Clone, Debug)]
#[command(version, about = "NetBird admission webhooks", long_about = None)]
struct Args {
    /// Bind address for the webhook server
    #[arg(long, default_value = "0.0.0.0:8443")]
    bind: String,

    /// Directory holding the serving certificate
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    cert_dir: String,

    #[arg(long, default_value = "tls.crt")]
    cert_name: String,

    #[arg(long, default_value = "tls.key")]
    key_name: String,

    #[arg(long, env = "NB_MANAGEMENT_URL", default_value = "https://api.netbird.io")]
    management_url: String,

    #[arg(long, default_value = "netbirdio/netbird:latest")]
    client_image: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable");

    let with_client = {
        let client = client.clone();
        warp::any().map(move || client.clone())
    };
    let with_args = {
        let args = args.clone();
        warp::any().map(move || args.clone())
    };

    let groups = warp::path("validate-nbgroup")
        .and(warp::body::json())
        .and(with_client.clone())
        .and_then(validate_group_handler);
    let resources = warp::path("validate-nbresource")
        .and(warp::body::json())
        .and(with_client.clone())
        .and_then(validate_resource_handler);
    let routing_peers = warp::path("validate-nbroutingpeer")
        .and(warp::body::json())
        .and(with_client.clone())
        .and_then(validate_routing_peer_handler);
    let setup_keys = warp::path("validate-nbsetupkey")
        .and(warp::body::json())
        .and(with_client.clone())
        .and_then(validate_setup_key_handler);
    let pods = warp::path("mutate-pod")
        .and(warp::body::json())
        .and(with_client.clone())
        .and(with_args.clone())
        .and_then(mutate_pod_handler);

    let routes = groups
        .or(resources)
        .or(routing_peers)
        .or(setup_keys)
        .or(pods)
        .with(warp::trace::request());

    // The MutatingWebhookConfiguration carries the CA for this pair;
    // TLS terminates here.
    info!("admission webhooks listening on {}", args.bind);
    warp::serve(warp::post().and(routes))
        .tls()
        .cert_path(format!("{}/{}", args.cert_dir, args.cert_name))
        .key_path(format!("{}/{}", args.cert_dir, args.key_name))
        .run(args.bind.parse::<std::net::SocketAddr>().unwrap())
        .await;
}

fn parse_request(
    body: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    body.try_into().map_err(|err: kube::core::admission::ConvertAdmissionReviewError| {
        error!("invalid admission request: {}", err);
        AdmissionResponse::invalid(err.to_string())
    })
}

async fn validate_group_handler(
    body: AdmissionReview<DynamicObject>,
    client: Client,
) -> Result<impl Reply, Infallible> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(res) => return Ok(reply::json(&res.into_review())),
    };
    let res = admission::validate_group_delete(&client, &req).await;
    Ok(reply::json(&res.into_review()))
}

async fn validate_resource_handler(
    body: AdmissionReview<DynamicObject>,
    client: Client,
) -> Result<impl Reply, Infallible> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(res) => return Ok(reply::json(&res.into_review())),
    };
    let res = admission::validate_resource_delete(&client, &req).await;
    Ok(reply::json(&res.into_review()))
}

async fn validate_routing_peer_handler(
    body: AdmissionReview<DynamicObject>,
    client: Client,
) -> Result<impl Reply, Infallible> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(res) => return Ok(reply::json(&res.into_review())),
    };
    let res = admission::validate_routing_peer_delete(&client, &req).await;
    Ok(reply::json(&res.into_review()))
}

async fn validate_setup_key_handler(
    body: AdmissionReview<DynamicObject>,
    client: Client,
) -> Result<impl Reply, Infallible> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(res) => return Ok(reply::json(&res.into_review())),
    };
    let res = admission::validate_setup_key(&client, &req).await;
    Ok(reply::json(&res.into_review()))
}

async fn mutate_pod_handler(
    body: AdmissionReview<DynamicObject>,
    client: Client,
    args: Args,
) -> Result<impl Reply, Infallible> {
    let req = match parse_request(body) {
        Ok(req) => req,
        Err(res) => return Ok(reply::json(&res.into_review())),
    };
    let res =
        admission::mutate_pod(&client, &req, &args.management_url, &args.client_image).await;
    Ok(reply::json(&res.into_review()))
}
