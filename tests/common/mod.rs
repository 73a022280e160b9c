//! Shared harness: a simulated driver with a running registry thread

#![allow(dead_code)]

use std::thread::{self, JoinHandle};
use std::time::Duration;

use liteipc::{IpcClient, IpcConfig, Registry, Result, SimKernel, SimTransport};

pub type Client = IpcClient<SimTransport>;

pub struct Harness {
    pub kernel: SimKernel,
    pub config: IpcConfig,
    /// Speaks for the registry task
    control: Client,
    cms: JoinHandle<(Registry<SimTransport>, Result<()>)>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(IpcConfig::default().with_call_timeout(Duration::from_secs(2)))
    }

    pub fn with_config(config: IpcConfig) -> Self {
        let kernel = SimKernel::with_config(&config);
        let mut registry = Registry::new(kernel.open_task().expect("open registry"), config);
        registry.elect().expect("elect registry");
        let control = registry.controller();
        let cms = thread::spawn(move || {
            let served = registry.run();
            (registry, served)
        });
        Self {
            kernel,
            config,
            control,
            cms,
        }
    }

    pub fn client(&self) -> Client {
        let client = IpcClient::new(self.kernel.open_task().expect("open task"), self.config);
        client.ensure_mapped().expect("map pool");
        client
    }

    /// Stop the registry loop and hand back the registry for inspection
    pub fn stop(self) -> (Registry<SimTransport>, Result<()>) {
        self.control.stop_registry().expect("send stop");
        self.join()
    }

    pub fn join(self) -> (Registry<SimTransport>, Result<()>) {
        self.cms.join().expect("registry thread panicked")
    }
}

/// Serve `name` with an echo handler on its own thread
pub fn spawn_echo(harness: &Harness, name: &str) -> (liteipc::ServiceIdentity, JoinHandle<Result<()>>) {
    let server = harness.client();
    let identity = server.register_service(name).expect("register");
    let handle = thread::spawn(move || {
        server.serve_loop(|msg| match msg.code() {
            STOP => liteipc::Outcome::Stop,
            FAIL => liteipc::Outcome::Fail(msg.code() * 10),
            _ => liteipc::Outcome::Reply(msg.payload().to_vec()),
        })
    });
    (identity, handle)
}

pub const ECHO: u32 = 1;
pub const STOP: u32 = 2;
pub const FAIL: u32 = 3;
