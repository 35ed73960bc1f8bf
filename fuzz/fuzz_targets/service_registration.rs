#![no_main]

use ferrous_modular::{define_request, define_singleton, ModularError, ServiceDeps, ServiceRegistry};
use libfuzzer_sys::fuzz_target;

// Each byte pair declares one service: the first byte picks its name and
// lifetime, the second the service it depends on (if any).
fuzz_target!(|data: &[u8]| {
    let registry = ServiceRegistry::new();
    for pair in data.chunks_exact(2).take(32) {
        let name = format!("s{}", pair[0] % 8);
        let dependency = (pair[1] % 10 < 8).then(|| format!("s{}", pair[1] % 8));
        let result = if pair[0] & 0x80 == 0 {
            registry.register(define_singleton(name, move |deps: ServiceDeps| {
                let dependency = dependency.clone();
                async move {
                    if let Some(dependency) = dependency {
                        deps.services.get::<u8>(&dependency).await?;
                    }
                    Ok(0u8)
                }
            }))
        } else {
            registry.register(define_request(name, move |deps: ServiceDeps, _| {
                let dependency = dependency.clone();
                async move {
                    if let Some(dependency) = dependency {
                        deps.services.get::<u8>(&dependency).await?;
                    }
                    Ok(0u8)
                }
            }))
        };
        if let Err(err) = result {
            assert!(matches!(err, ModularError::DuplicateRegistration { .. }));
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    for name in registry.names() {
        let services = registry.resolve();
        let _ = runtime.block_on(services.get::<u8>(&name));
        assert!(services.resolution_stack().is_empty());
        assert_eq!(registry.constructions_in_flight(), 0);
    }
});
