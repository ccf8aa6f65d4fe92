use clique::{
    CliqueIdCallback, CliqueKey, Collectives, CollectivesBackend, CollectivesConfig,
    ConfigResolver, GroupHandle, GroupRequest, LoopbackFactory, Result,
};
use std::sync::Arc;
use std::time::Duration;

/// Short timeouts so failure tests complete quickly.
pub fn fast_config() -> CollectivesConfig {
    CollectivesConfig::default()
        .with_exchange_timeout(Duration::from_millis(300))
        .with_publish_timeout(Duration::from_millis(200))
}

pub fn collectives_with(backend: ConfigResolver, config: CollectivesConfig) -> Arc<Collectives> {
    let backend: Arc<dyn CollectivesBackend> = Arc::new(backend);
    Arc::new(Collectives::new(backend, Arc::new(LoopbackFactory), config))
}

pub fn collectives() -> Arc<Collectives> {
    collectives_with(
        ConfigResolver::new(false),
        CollectivesConfig::default().with_exchange_timeout(Duration::from_secs(5)),
    )
}

/// Form `key` once per listed device, concurrently, and collect every
/// participant's outcome in device order.
pub async fn form_devices(
    collectives: &Arc<Collectives>,
    key: &CliqueKey,
    devices: &[u32],
    callback: Option<Arc<dyn CliqueIdCallback>>,
) -> Vec<Result<GroupHandle>> {
    let mut handles = Vec::new();
    for &device in devices {
        let c = Arc::clone(collectives);
        let mut request = GroupRequest::new(key.clone(), device);
        if let Some(cb) = &callback {
            request = request.with_callback(Arc::clone(cb));
        }
        handles.push(tokio::spawn(async move { c.form_group(request).await }));
    }
    let mut outcomes = Vec::new();
    for h in handles {
        outcomes.push(h.await.unwrap());
    }
    outcomes
}

/// Form `key` with every member participating.
pub async fn form_all(
    collectives: &Arc<Collectives>,
    key: &CliqueKey,
    callback: Option<Arc<dyn CliqueIdCallback>>,
) -> Vec<Result<GroupHandle>> {
    let devices = key.devices().to_vec();
    form_devices(collectives, key, &devices, callback).await
}
