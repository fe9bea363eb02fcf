//! Fakes and fixtures shared by the unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::device::{Actuator, DeviceIdentity, DeviceKind, DeviceRegistry, State};
use crate::error::DeviceError;
use crate::health::HealthPolicy;
use crate::sensor::{Measurement, SensorGate, SensorSettings, SensorSource, SensorUnavailable};
use crate::state::{AppState, SharedState};
use crate::store::Storage;

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

/// In-memory actuator. `journal` is shared by every fake of one registry so
/// tests can assert the global order of transitions.
#[derive(Default)]
pub struct FakeActuator {
    pub id: String,
    pub on: AtomicBool,
    pub fail: AtomicBool,
    pub hang: AtomicBool,
    pub sets: AtomicUsize,
    pub queries: AtomicUsize,
    pub transitions: Mutex<Vec<bool>>,
    pub journal: Arc<Mutex<Vec<(String, bool)>>>,
}

impl FakeActuator {
    async fn gate(&self) -> Result<(), DeviceError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::unreachable("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for Arc<FakeActuator> {
    async fn set(&self, on: bool) -> Result<(), DeviceError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        self.on.store(on, Ordering::SeqCst);
        self.transitions.lock().unwrap().push(on);
        self.journal.lock().unwrap().push((self.id.clone(), on));
        Ok(())
    }

    async fn query(&self) -> Result<State, DeviceError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(State::from_on(self.on.load(Ordering::SeqCst)))
    }

    async fn probe(&self) -> Result<String, DeviceError> {
        self.gate().await?;
        Ok(format!("fake {}", self.id))
    }
}

pub fn fake_registry(ids: &[&str]) -> (Arc<DeviceRegistry>, Vec<Arc<FakeActuator>>) {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut fakes = Vec::new();
    let mut devices: Vec<(DeviceIdentity, Box<dyn Actuator>)> = Vec::new();

    for (i, id) in ids.iter().enumerate() {
        let fake = Arc::new(FakeActuator {
            id: id.to_string(),
            journal: Arc::clone(&journal),
            ..FakeActuator::default()
        });
        let identity = DeviceIdentity {
            device_id: id.to_string(),
            name: format!("Zone {id}"),
            kind: DeviceKind::ContactRelay {
                gpio_pin: 17 + i as u8,
                active_low: true,
            },
            timeout: Duration::from_secs(1),
        };
        devices.push((identity, Box::new(Arc::clone(&fake))));
        fakes.push(fake);
    }

    (
        Arc::new(DeviceRegistry::new(devices, HealthPolicy::default())),
        fakes,
    )
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// Sensor source returning a settable humidity. `None` means the fetch fails.
pub struct ScriptedSensor {
    pub humidity: Mutex<Option<f64>>,
    pub calls: AtomicUsize,
}

impl ScriptedSensor {
    pub fn new(humidity: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            humidity: Mutex::new(humidity),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, humidity: Option<f64>) {
        *self.humidity.lock().unwrap() = humidity;
    }
}

#[async_trait]
impl SensorSource for Arc<ScriptedSensor> {
    async fn fetch(&self) -> Result<Measurement, SensorUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.humidity.lock().unwrap() {
            Some(humidity) => Ok(Measurement {
                temperature: 18.5,
                humidity,
            }),
            None => Err(SensorUnavailable::Unreachable("scripted outage".into())),
        }
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

// ---------------------------------------------------------------------------
// Application fixture
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub app: SharedState,
    pub fakes: Vec<Arc<FakeActuator>>,
    pub sensor: Arc<ScriptedSensor>,
    _dir: TempDir,
}

impl TestApp {
    pub fn new(ids: &[&str], humidity: Option<f64>) -> Self {
        let (registry, fakes) = fake_registry(ids);
        let sensor = ScriptedSensor::new(humidity);
        let gate = SensorGate::new(
            Some(Box::new(Arc::clone(&sensor))),
            SensorSettings::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let app = Arc::new(AppState::new(registry, gate, storage));
        Self {
            app,
            fakes,
            sensor,
            _dir: dir,
        }
    }

    pub fn journal(&self) -> Vec<(String, bool)> {
        self.fakes[0].journal.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// HTTP stub server
// ---------------------------------------------------------------------------

/// Serve `router` on an ephemeral local port for the lifetime of the test.
pub async fn spawn_stub(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
