use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use wayfinder_common::{
    ClusterProperties, JsonSerializer, PropertyKind, PropertyRecord, Result, ServiceProperties, UriProperties,
};
use wayfinder_store::{
    Coordination, CoordinationEvent, CoordinationStore, FileStore, Merger, NodeLayout, PropertyEventBus,
    PropertyStore, TogglingStore, uri_merger,
};

/// The three property pipelines of one coordination session.
///
/// Each kind gets a coordination-backed primary, a file backup under
/// `<backup_dir>/<kind>` and its own bus.
#[derive(Clone)]
pub struct DiscoveryStores {
    pub clusters: TogglingStore<ClusterProperties>,
    pub services: TogglingStore<ServiceProperties>,
    pub uris: TogglingStore<UriProperties>,
    cluster_primary: Arc<CoordinationStore<ClusterProperties>>,
    service_primary: Arc<CoordinationStore<ServiceProperties>>,
    uri_primary: Arc<CoordinationStore<UriProperties>>,
}

impl DiscoveryStores {
    pub fn new(coordination: Arc<dyn Coordination>, base_path: &str, backup_dir: &Path) -> Result<Self> {
        let layout = NodeLayout::new(base_path);
        let (cluster_primary, clusters) =
            toggling::<ClusterProperties>(&coordination, &layout, PropertyKind::Cluster, backup_dir, None)?;
        let (service_primary, services) =
            toggling::<ServiceProperties>(&coordination, &layout, PropertyKind::Service, backup_dir, None)?;
        let (uri_primary, uris) = toggling::<UriProperties>(
            &coordination,
            &layout,
            PropertyKind::Uris,
            backup_dir,
            Some(uri_merger()),
        )?;
        Ok(Self {
            clusters,
            services,
            uris,
            cluster_primary,
            service_primary,
            uri_primary,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.clusters.start().await?;
        self.services.start().await?;
        self.uris.start().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.clusters.shutdown().await?;
        self.services.shutdown().await?;
        self.uris.shutdown().await
    }

    /// Switches all three pipelines to the primary. The first failure wins.
    pub async fn enable_primary(&self) -> Result<()> {
        let (clusters, services, uris) = tokio::join!(
            self.clusters.enable_primary(),
            self.services.enable_primary(),
            self.uris.enable_primary()
        );
        clusters.and(services).and(uris)
    }

    pub async fn enable_backup(&self) -> Result<()> {
        let (clusters, services, uris) = tokio::join!(
            self.clusters.enable_backup(),
            self.services.enable_backup(),
            self.uris.enable_backup()
        );
        clusters.and(services).and(uris)
    }

    /// Routes a watch notification to the primary it belongs to.
    pub fn handle_event(&self, event: &CoordinationEvent) -> bool {
        self.cluster_primary.handle_event(event)
            || self.service_primary.handle_event(event)
            || self.uri_primary.handle_event(event)
    }

    /// Announces endpoints of `cluster` as an ephemeral child of this session.
    pub async fn announce(&self, cluster: &str, uris: UriProperties) -> Result<()> {
        self.uri_primary.put(cluster, uris).await
    }

    /// Withdraws this session's announcements for `cluster`.
    pub async fn withdraw(&self, cluster: &str) -> Result<()> {
        self.uri_primary.remove(cluster).await
    }
}

type Pipeline<T> = (Arc<CoordinationStore<T>>, TogglingStore<T>);

fn toggling<T>(
    coordination: &Arc<dyn Coordination>,
    layout: &NodeLayout,
    kind: PropertyKind,
    backup_dir: &Path,
    merger: Option<Merger<T>>,
) -> Result<Pipeline<T>>
where
    T: PropertyRecord + Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    let serializer = Arc::new(JsonSerializer::<T>::new());
    let primary = Arc::new(match merger {
        Some(merger) => {
            CoordinationStore::merged(coordination.clone(), layout.clone(), kind, serializer.clone(), merger)
        }
        None => CoordinationStore::single(coordination.clone(), layout.clone(), kind, serializer.clone()),
    });
    let backup: Arc<dyn PropertyStore<T>> =
        Arc::new(FileStore::open(backup_dir.join(kind.dir_name()), serializer)?);
    let store = TogglingStore::new(
        kind.dir_name(),
        primary.clone() as Arc<dyn PropertyStore<T>>,
        backup,
        Arc::new(PropertyEventBus::new()),
    );
    Ok((primary, store))
}
