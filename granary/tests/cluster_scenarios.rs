//! End-to-end cluster scenarios over real TCP loopback connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use granary::{
    Client, ClusterConfig, ConnectionConfig, Grain, GrainContext, GrainError, GrainId,
    GrainRegistration, GrainType, InMemoryMembershipTable, JsonCodec, MembershipConfig,
    MessageCodec, NetworkAddress, PlacementStrategy, ReentrancyPolicy, RouterConfig, Silo,
    SiloStatus,
};

const COUNTER: GrainType = GrainType(0xC0_04);
const SERIAL: GrainType = GrainType(0x5E_71);

mod counter_methods {
    pub const INCREMENT: u32 = 1;
    pub const GET: u32 = 2;
    pub const WHO: u32 = 3;
}

mod serial_methods {
    pub const SLOW_TOUCH: u32 = 1;
    pub const COMPLETED: u32 = 2;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncrementRequest {
    amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ValueResponse {
    value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IdentityResponse {
    runtime_identity: String,
}

#[derive(Default)]
struct CounterGrain {
    value: i64,
}

#[async_trait]
impl Grain for CounterGrain {
    async fn handle(
        &mut self,
        ctx: &GrainContext,
        method: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        let codec = JsonCodec;
        match method {
            counter_methods::INCREMENT => {
                let req: IncrementRequest = codec.decode(body)?;
                self.value += req.amount;
                Ok(codec.encode(&ValueResponse { value: self.value })?)
            }
            counter_methods::GET => Ok(codec.encode(&ValueResponse { value: self.value })?),
            counter_methods::WHO => Ok(codec.encode(&IdentityResponse {
                runtime_identity: ctx.runtime_identity(),
            })?),
            other => Err(GrainError::UnknownMethod(other)),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Sets a flag, holds it across a real delay, and fails if a second turn
/// ever observes the flag already set.
#[derive(Default)]
struct SerialGrain {
    busy: bool,
    completed: i64,
}

#[async_trait]
impl Grain for SerialGrain {
    async fn handle(
        &mut self,
        _ctx: &GrainContext,
        method: u32,
        _body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        let codec = JsonCodec;
        match method {
            serial_methods::SLOW_TOUCH => {
                if self.busy {
                    return Err(GrainError::Application(
                        "turn overlap observed".to_string(),
                    ));
                }
                self.busy = true;
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.busy = false;
                self.completed += 1;
                Ok(codec.encode(&ValueResponse {
                    value: self.completed,
                })?)
            }
            serial_methods::COMPLETED => Ok(codec.encode(&ValueResponse {
                value: self.completed,
            })?),
            other => Err(GrainError::UnknownMethod(other)),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn free_endpoint() -> NetworkAddress {
    init_tracing();
    let probe = TcpListener::bind(("127.0.0.1", 0)).await.expect("probe");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);
    NetworkAddress::localhost(port)
}

async fn start_silo(
    backend: Arc<InMemoryMembershipTable>,
    generation: i64,
) -> Silo {
    let endpoint = free_endpoint().await;
    Silo::builder(ClusterConfig::new("scenario-cluster"))
        .bind(endpoint)
        .generation(generation)
        .membership(backend)
        .membership_config(MembershipConfig::local())
        .router_config(RouterConfig::local())
        .connection_config(ConnectionConfig::local())
        .register(
            GrainRegistration::new::<CounterGrain>(COUNTER)
                .placement(PlacementStrategy::PreferLocal),
        )
        .register(
            GrainRegistration::new::<SerialGrain>(SERIAL)
                .placement(PlacementStrategy::PreferLocal)
                .reentrancy(ReentrancyPolicy::NonReentrant),
        )
        .start()
        .await
        .expect("silo starts")
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_single_silo_counter_roundtrip() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let silo = start_silo(backend, 1).await;

    let alice = GrainId::text(COUNTER, "alice");
    let resp: ValueResponse = silo
        .call_typed(alice.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 42 })
        .await
        .expect("increment");
    assert_eq!(resp.value, 42);

    let resp: ValueResponse = silo
        .call_typed(alice, counter_methods::GET, &())
        .await
        .expect("get");
    assert_eq!(resp.value, 42);

    silo.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_cross_silo_call_sees_one_activation() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let s1 = start_silo(backend.clone(), 1).await;
    let s2 = start_silo(backend.clone(), 2).await;

    wait_until("both silos active", Duration::from_secs(10), || {
        s1.membership().snapshot().active_silos().len() == 2
            && s2.membership().snapshot().active_silos().len() == 2
    })
    .await;

    // Activate on s1 (prefer-local), then mutate through s2: both must
    // reach the same activation.
    let grain = GrainId::text(COUNTER, "shared-counter");
    let _: ValueResponse = s1
        .call_typed(grain.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 10 })
        .await
        .expect("increment via s1");
    let resp: ValueResponse = s2
        .call_typed(grain.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 5 })
        .await
        .expect("increment via s2");
    assert_eq!(resp.value, 15);

    s1.shutdown().await;
    s2.shutdown().await;
}

/// Scenario: registration race. Two silos concurrently invoke a grain
/// with no prior activation; exactly one activation may exist, and both
/// callers observe the identical runtime identity.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_registration_race_single_winner() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let s1 = Arc::new(start_silo(backend.clone(), 1).await);
    let s2 = Arc::new(start_silo(backend.clone(), 2).await);

    // Both silos must see each other before racing.
    wait_until("both silos active", Duration::from_secs(10), || {
        s1.membership().snapshot().active_silos().len() == 2
            && s2.membership().snapshot().active_silos().len() == 2
    })
    .await;

    let grain = GrainId::text(COUNTER, "raced-grain");
    let (g1, g2) = (grain.clone(), grain.clone());
    let (c1, c2) = (s1.clone(), s2.clone());
    let call1 = tokio::spawn(async move {
        c1.call_typed::<(), IdentityResponse>(g1, counter_methods::WHO, &())
            .await
            .expect("call via s1")
    });
    let call2 = tokio::spawn(async move {
        c2.call_typed::<(), IdentityResponse>(g2, counter_methods::WHO, &())
            .await
            .expect("call via s2")
    });

    let id1 = call1.await.expect("join 1");
    let id2 = call2.await.expect("join 2");
    assert_eq!(
        id1.runtime_identity, id2.runtime_identity,
        "both callers must observe the same activation"
    );

    // Exactly one authoritative directory entry exists cluster-wide.
    wait_until("single directory entry", Duration::from_secs(10), || {
        let total = s1
            .directory()
            .lookup_local(&grain)
            .into_iter()
            .chain(s2.directory().lookup_local(&grain))
            .count();
        total == 1
    })
    .await;

    s1.shutdown().await;
    s2.shutdown().await;
}

/// Scenario: cache invalidation on silo death. A grain lives on s2 and is
/// cached on s1; killing s2 must leave s1 able to reach a fresh
/// activation, with the dead address dropped from its cache.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_silo_death_invalidates_cache_and_recovers() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let s1 = start_silo(backend.clone(), 1).await;
    let s2 = start_silo(backend.clone(), 2).await;

    wait_until("both silos active", Duration::from_secs(10), || {
        s1.membership().snapshot().active_silos().len() == 2
    })
    .await;

    // Activate on s2, then call from s1 so s1 resolves (and caches) the
    // activation's location.
    let grain = GrainId::text(COUNTER, "doomed-host-grain");
    let _: ValueResponse = s2
        .call_typed(grain.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 1 })
        .await
        .expect("activate on s2");
    let resp: ValueResponse = s1
        .call_typed(grain.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 1 })
        .await
        .expect("call from s1");
    assert_eq!(resp.value, 2);

    // Kill s2 the hard way.
    let s2_address = s2.address();
    s2.abandon();

    wait_until("s2 declared dead", Duration::from_secs(15), || {
        s1.membership().snapshot().status_of(&s2_address) == Some(SiloStatus::Dead)
    })
    .await;

    // The next call must succeed on a fresh activation elsewhere.
    let resp: ValueResponse = s1
        .call_typed(grain.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 1 })
        .await
        .expect("call after s2 death");
    // State is volatile: a fresh activation starts from zero.
    assert_eq!(resp.value, 1);

    // And the directory must no longer point anywhere near s2.
    let resolved = s1.directory().lookup(&grain).await.expect("lookup");
    let address = resolved.expect("grain resolvable after recovery");
    assert_ne!(address.silo, s2_address);

    s1.shutdown().await;
}

/// Scenario: scheduler serialization. Ten concurrent calls to a
/// non-reentrant activation never overlap and all complete.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_non_reentrant_turns_never_overlap() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let silo = Arc::new(start_silo(backend, 1).await);

    let grain = GrainId::text(SERIAL, "serial-grain");
    let failures = Arc::new(AtomicUsize::new(0));

    let mut calls = Vec::new();
    for _ in 0..10 {
        let silo = silo.clone();
        let grain = grain.clone();
        let failures = failures.clone();
        calls.push(tokio::spawn(async move {
            let result: Result<ValueResponse, _> = silo
                .call_typed(grain, serial_methods::SLOW_TOUCH, &())
                .await;
            if result.is_err() {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for call in calls {
        call.await.expect("join");
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0, "observed turn overlap");

    let resp: ValueResponse = silo
        .call_typed(grain, serial_methods::COMPLETED, &())
        .await
        .expect("completed count");
    assert_eq!(resp.value, 10);

    silo.shutdown().await;
}

/// A gateway client routes through its silo and sees ordinary responses
/// and application errors.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_client_calls_through_gateway() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let silo = start_silo(backend, 1).await;

    let client = Client::connect(
        silo.address(),
        "scenario-cluster",
        "test-client",
        ConnectionConfig::local(),
    )
    .with_response_timeout(Duration::from_secs(5));

    let grain = GrainId::text(COUNTER, "client-counter");
    let resp: ValueResponse = client
        .call_typed(grain.clone(), counter_methods::INCREMENT, &IncrementRequest { amount: 7 })
        .await
        .expect("client call");
    assert_eq!(resp.value, 7);

    // Unknown methods surface as application errors, not hangs.
    let err = client
        .call(grain, 9999, Vec::new())
        .await
        .expect_err("unknown method fails");
    assert!(err.to_string().contains("unknown method"), "got: {err}");

    client.shutdown();
    silo.shutdown().await;
}

/// A wrong-cluster client is refused at the preamble and its calls time
/// out rather than crossing the boundary.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_wrong_cluster_client_is_refused() {
    let backend = Arc::new(InMemoryMembershipTable::new());
    let silo = start_silo(backend, 1).await;

    let client = Client::connect(
        silo.address(),
        "some-other-cluster",
        "stray-client",
        ConnectionConfig::local(),
    )
    .with_response_timeout(Duration::from_millis(500));

    let result = client
        .call(GrainId::text(COUNTER, "x"), counter_methods::GET, Vec::new())
        .await;
    assert!(result.is_err(), "call crossed a cluster boundary");

    client.shutdown();
    silo.shutdown().await;
}
