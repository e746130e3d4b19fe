#![allow(dead_code)]

use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;
use vkbridge_host::driver::{DeviceCreateInfo, DeviceQueueCreateInfo, HostDriver, SoftHostDriver};
use vkbridge_host::emulation::{CpuDecompressor, NoCpuDecompressor};
use vkbridge_host::{BoxedHandle, HostConfig, Registry};

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Host {
    pub driver: Arc<SoftHostDriver>,
    pub registry: Arc<Registry>,
    pub instance: BoxedHandle,
    pub device: BoxedHandle,
    pub queue: BoxedHandle,
}

pub fn host(driver: SoftHostDriver) -> Host {
    host_with(driver, HostConfig::default(), Arc::new(NoCpuDecompressor))
}

pub fn host_with(driver: SoftHostDriver, config: HostConfig, decoder: Arc<dyn CpuDecompressor>) -> Host {
    init_tracing();
    let driver = Arc::new(driver);
    let registry = Registry::new(config, Arc::clone(&driver) as Arc<dyn HostDriver>, decoder);
    let instance = registry.create_instance(&Default::default()).expect("create instance");
    let device = create_device(&registry, instance);
    let queue = registry.get_device_queue(device, 0, 0).expect("get queue");
    Host {
        driver,
        registry,
        instance,
        device,
        queue,
    }
}

pub fn create_device(registry: &Registry, instance: BoxedHandle) -> BoxedHandle {
    let physical_device = registry
        .enumerate_physical_devices(instance)
        .expect("enumerate physical devices")[0];
    registry
        .create_device(
            physical_device,
            &DeviceCreateInfo {
                queue_create_infos: vec![DeviceQueueCreateInfo {
                    family_index: 0,
                    queue_count: 1,
                }],
                ..Default::default()
            },
        )
        .expect("create device")
}
