use std::sync::Arc;

use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::Parser;
use serde_json::json;

use operator::config::Settings;
use operator::mesh::{MeshApi, MeshClient};
use operator::{
    group_controller, policy_controller, resource_controller, routingpeer_controller,
    service_controller, setupkey_controller, telemetry,
};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<ControllerStates>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(&c.diagnostics().await)
}

/// Per-kind controller states, shared with the diagnostics endpoint.
#[derive(Clone)]
struct ControllerStates {
    groups: group_controller::State,
    setup_keys: setupkey_controller::State,
    policies: policy_controller::State,
    resources: resource_controller::State,
    routing_peers: routingpeer_controller::State,
    services: service_controller::State,
}

impl ControllerStates {
    fn new(mesh: Arc<dyn MeshApi>, settings: Arc<Settings>) -> Self {
        Self {
            groups: group_controller::State::new(mesh.clone(), settings.clone()),
            setup_keys: setupkey_controller::State::new(mesh.clone(), settings.clone()),
            policies: policy_controller::State::new(mesh.clone(), settings.clone()),
            resources: resource_controller::State::new(mesh.clone(), settings.clone()),
            routing_peers: routingpeer_controller::State::new(mesh.clone(), settings.clone()),
            services: service_controller::State::new(mesh, settings),
        }
    }

    async fn diagnostics(&self) -> serde_json::Value {
        json!({
            "nbgroup": self.groups.diagnostics().await,
            "nbsetupkey": self.setup_keys.diagnostics().await,
            "nbpolicy": self.policies.diagnostics().await,
            "nbresource": self.resources.diagnostics().await,
            "nbroutingpeer": self.routing_peers.diagnostics().await,
            "service": self.services.diagnostics().await,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let settings = Arc::new(Settings::parse());
    let mesh: Arc<dyn MeshApi> =
        Arc::new(MeshClient::new(&settings.management_url, &settings.api_key));

    let states = ControllerStates::new(mesh, settings.clone());
    let group_ctrl = group_controller::run_groups(states.groups.clone());
    let setup_key_ctrl = setupkey_controller::run_setup_keys(states.setup_keys.clone());
    let policy_ctrl = policy_controller::run_policies(states.policies.clone());
    let resource_ctrl = resource_controller::run_resources(states.resources.clone());
    let routing_peer_ctrl = routingpeer_controller::run_routing_peers(states.routing_peers.clone());
    let service_ctrl = service_controller::run_services(states.services.clone());

    let server_states = states.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_states.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(&settings.probe_bind)?
    .shutdown_timeout(5);

    // All runtimes implement graceful shutdown, so poll until all are done
    let (_, _, _, _, _, _, server_result) = tokio::join!(
        group_ctrl,
        setup_key_ctrl,
        policy_ctrl,
        resource_ctrl,
        routing_peer_ctrl,
        service_ctrl,
        server.run()
    );
    server_result?;
    Ok(())
}
