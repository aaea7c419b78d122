//! CLI for RelayMQ
//!
//! Subcommands:
//! - `broker`: run the queue broker
//! - `ingress`: run the HTTP publish endpoint
//! - `consumer`: run the consumer worker and its inspection endpoint

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use relaymq::broker::Broker;
use relaymq::config::{DEMO_QUEUE, Settings, load_config};
use relaymq::ingress::{self, BrokerPublisher, inspect};
use relaymq::sink::MessageSink;
use relaymq::transport::start_websocket_server;
use relaymq::utils::logging;
use relaymq::worker::{ConsumerWorker, WorkerState};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relaymq")]
enum Command {
    /// Start the queue broker
    Broker,
    /// Start the HTTP ingress that publishes to the broker
    Ingress,
    /// Start the consumer worker with its inspection endpoint
    Consumer,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&config.log_level);

    let result = match cmd {
        Command::Broker => run_broker(config).await,
        Command::Ingress => run_ingress(config).await,
        Command::Consumer => run_consumer(config).await,
    };

    if let Err(e) = result {
        error!("Exited with error: {}", e);
        std::process::exit(1);
    }
}

async fn run_broker(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Mutex::new(Broker::new(&config.server)?));

    tokio::spawn(Broker::start_redelivery_loop(
        broker.clone(),
        Duration::from_secs(config.server.ack_timeout_secs),
    ));

    tokio::select! {
        res = start_websocket_server(addr, broker, config.server.clone()) => {
            res?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn run_ingress(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.http.host, config.http.ingress_port);
    let publisher = Arc::new(BrokerPublisher::new(config.broker, DEMO_QUEUE));
    let app = ingress::router(publisher);

    let listener = TcpListener::bind(&addr).await?;
    info!("Ingress listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received. Exiting gracefully.");
        })
        .await?;

    Ok(())
}

async fn run_consumer(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let sink = MessageSink::new();
    let recorder = sink.clone();
    let worker = ConsumerWorker::new(config.broker, config.worker, DEMO_QUEUE, move |message| {
        info!(id = %message.id, content = %message.content, "received message");
        recorder.add(message);
        Ok(())
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_task = tokio::spawn(worker.run(shutdown_rx));

    let addr = format!("{}:{}", config.http.host, config.http.consumer_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Consumer inspection endpoint on http://{}", addr);
    let mut http_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(async move {
        axum::serve(listener, inspect::router(sink))
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let final_state = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Stopping consumer.");
            let _ = shutdown_tx.send(true);
            worker_task.await?
        }
        state = &mut worker_task => {
            let _ = shutdown_tx.send(true);
            state?
        }
    };

    server.await??;

    if final_state == WorkerState::Faulted {
        return Err("consumer worker gave up reconnecting to the broker".into());
    }
    Ok(())
}
