//! Durable reminders firing through the full routing stack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use granary::{
    ClusterConfig, ConnectionConfig, Grain, GrainContext, GrainError, GrainId,
    GrainRegistration, GrainType, InMemoryMembershipTable, InMemoryReminderStore, JsonCodec,
    MembershipConfig, MessageCodec, NetworkAddress, ReminderEntry, ReminderStore, RouterConfig,
    Silo, epoch_ms,
};

const WAKER: GrainType = GrainType(0x4A11);

mod waker_methods {
    pub const TICKS: u32 = 1;
}

#[derive(Default)]
struct WakerGrain {
    ticks: Vec<String>,
}

#[async_trait]
impl Grain for WakerGrain {
    async fn handle(
        &mut self,
        _ctx: &GrainContext,
        method: u32,
        _body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        match method {
            waker_methods::TICKS => Ok(JsonCodec.encode(&self.ticks)?),
            other => Err(GrainError::UnknownMethod(other)),
        }
    }

    async fn on_reminder(&mut self, _ctx: &GrainContext, reminder: &str) -> Result<(), GrainError> {
        self.ticks.push(reminder.to_string());
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_reminder_fires_as_grain_invocation() {
    let probe = TcpListener::bind(("127.0.0.1", 0)).await.expect("probe");
    let endpoint = NetworkAddress::localhost(probe.local_addr().expect("addr").port());
    drop(probe);

    let backend = Arc::new(InMemoryMembershipTable::new());
    let store: Arc<InMemoryReminderStore> = Arc::new(InMemoryReminderStore::new());

    let silo = Silo::builder(ClusterConfig::new("reminder-cluster"))
        .bind(endpoint)
        .generation(1)
        .membership(backend)
        .membership_config(MembershipConfig::local())
        .router_config(RouterConfig::local())
        .connection_config(ConnectionConfig::local())
        .reminder_store(store.clone())
        .reminder_refresh(Duration::from_millis(100))
        .register(GrainRegistration::new::<WakerGrain>(WAKER))
        .start()
        .await
        .expect("silo starts");

    // A reminder already due keeps firing every period.
    let grain = GrainId::text(WAKER, "sleepy");
    store
        .upsert(ReminderEntry::new(
            grain.clone(),
            "wake-up",
            epoch_ms(),
            Duration::from_millis(200),
        ))
        .await
        .expect("upsert");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let ticks: Vec<String> = silo
            .call_typed(grain.clone(), waker_methods::TICKS, &())
            .await
            .expect("ticks");
        if ticks.len() >= 2 {
            assert!(ticks.iter().all(|t| t == "wake-up"));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reminder never fired twice (got {ticks:?})"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Removing the row stops the ticks.
    let row = store
        .read_row(&grain, "wake-up")
        .await
        .expect("read")
        .expect("present");
    assert!(store.remove(&grain, "wake-up", &row.etag).await.expect("remove"));

    let ticks_at_removal: Vec<String> = silo
        .call_typed(grain.clone(), waker_methods::TICKS, &())
        .await
        .expect("ticks");
    tokio::time::sleep(Duration::from_millis(600)).await;
    let ticks_after: Vec<String> = silo
        .call_typed(grain.clone(), waker_methods::TICKS, &())
        .await
        .expect("ticks");
    assert!(
        ticks_after.len() <= ticks_at_removal.len() + 1,
        "reminder kept firing after removal"
    );

    silo.shutdown().await;
}
