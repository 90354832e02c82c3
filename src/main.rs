use kube::{Client, CustomResourceExt};
use tracing_subscriber::EnvFilter;
use unitset::config::Config;
use unitset::errors::*;
use unitset::manager::Manager;
use unitset::unit::Unit;
use unitset::unitset::UnitSet;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = libmain().await {
        log::error!("{}", e);
        for cause in e.iter().skip(1) {
            log::error!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn libmain() -> Result<()> {
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!(
            "{}---\n{}",
            serde_yaml::to_string(&UnitSet::crd())?,
            serde_yaml::to_string(&Unit::crd())?
        );
        return Ok(());
    }

    let config = Config::load()?;
    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    let (_manager, drainer) = Manager::new(client, config).await?;
    drainer.await;
    log::info!("controller stopped");
    Ok(())
}
