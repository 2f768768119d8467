//! Tests for the compile cache.

use anyhow::Result;
use ironframe::compile_cache::{CacheTimeouts, CompileCache, compute_checksum};
use ironframe::kernel::{ExprCompiler, KernelCompiler, KernelSource, Program};
use ironframe::testing::CountingCompiler;
use ironframe::EngineError;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;


fn square() -> KernelSource {
    KernelSource::new("square", "x * x")
}

#[test]
fn test_concurrent_callers_compile_once() {
    let compiler = Arc::new(CountingCompiler::new().with_delay(Duration::from_millis(50)));
    let cache = Arc::new(CompileCache::new(compiler.clone()));
    let barrier = Arc::new(Barrier::new(8));

    let kernels: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get_or_compile(&square()).unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(compiler.compilations(), 1);
    assert!(kernels.iter().all(|k| Arc::ptr_eq(k, &kernels[0])));
    let stats = cache.stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.hits + stats.misses, 8);
    assert_approx_eq!(kernels[0].eval(3.0), 9.0);
}

#[test]
fn test_distinct_kernels_get_distinct_artifacts() -> Result<()> {
    let compiler = Arc::new(CountingCompiler::new());
    let cache = CompileCache::new(compiler.clone());
    let a = cache.get_or_compile(&square())?;
    let b = cache.get_or_compile(&KernelSource::new("cube", "x ^ 3"))?;
    let a2 = cache.get_or_compile(&square())?;

    assert_eq!(compiler.compilations(), 2);
    assert_ne!(a.signature, b.signature);
    assert!(Arc::ptr_eq(&a, &a2));
    assert_eq!(compiler.compiled(), vec!["square".to_string(), "cube".to_string()]);
    Ok(())
}

#[test]
fn test_compile_failure_is_cached() {
    let compiler = Arc::new(CountingCompiler::new());
    let cache = CompileCache::new(compiler.clone());
    let broken = KernelSource::new("broken", "x +");

    for _ in 0..3 {
        match cache.get_or_compile(&broken) {
            Err(EngineError::Compile { kernel, signature, .. }) => {
                assert_eq!(kernel, "broken");
                assert_eq!(signature, cache.signature(&broken));
            }
            other => panic!("expected a compile error, got {other:?}"),
        }
    }
    assert_eq!(compiler.compilations(), 1);
}

#[test]
fn test_signature_depends_on_compiler_and_source() {
    let source = square();
    let same = KernelSource::new("square", "x * x");
    let other = KernelSource::new("square", "x*x ");
    assert_eq!(source.signature("expr-v1"), same.signature("expr-v1"));
    assert_ne!(source.signature("expr-v1"), other.signature("expr-v1"));
    assert_ne!(source.signature("expr-v1"), source.signature("expr-v2"));
    assert_eq!(source.signature(ExprCompiler.id()).len(), 64);
}

#[test]
fn test_shared_location_survives_new_instances() -> Result<()> {
    let dir = TempDir::new()?;
    let first = Arc::new(CountingCompiler::new());
    let cache = CompileCache::with_location(first.clone(), dir.path())?;
    let kernel = cache.get_or_compile(&square())?;
    assert_eq!(first.compilations(), 1);

    let signature = cache.signature(&square());
    assert!(dir.path().join(format!("{signature}.artifact")).exists());
    assert!(!dir.path().join(format!("{signature}.pending")).exists());

    // A fresh process-equivalent loads the artifact instead of compiling.
    let second = Arc::new(CountingCompiler::new());
    let other = CompileCache::with_location(second.clone(), dir.path())?;
    let loaded = other.get_or_compile(&square())?;
    assert_eq!(second.compilations(), 0);
    assert_eq!(other.stats().disk_loads, 1);
    assert_eq!(*loaded, *kernel);
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_independent_workers_share_one_compilation() {
    let dir = TempDir::new().unwrap();
    let compilers: Vec<_> = (0..4)
        .map(|_| Arc::new(CountingCompiler::new().with_delay(Duration::from_millis(100))))
        .collect();
    let barrier = Arc::new(Barrier::new(compilers.len()));

    let handles: Vec<_> = compilers
        .iter()
        .map(|compiler| {
            let cache = CompileCache::with_location(compiler.clone(), dir.path())
                .unwrap()
                .with_timeouts(CacheTimeouts {
                    poll_interval: Duration::from_millis(5),
                    ..CacheTimeouts::default()
                });
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get_or_compile(&square()).unwrap()
            })
        })
        .collect();
    let kernels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let total: usize = compilers.iter().map(|c| c.compilations()).sum();
    assert_eq!(total, 1);
    assert!(kernels.iter().all(|k| **k == *kernels[0]));
}

#[test]
fn test_failure_marker_is_shared() -> Result<()> {
    let dir = TempDir::new()?;
    let broken = KernelSource::new("broken", "sqrt(");
    let first = CompileCache::with_location(Arc::new(ExprCompiler), dir.path())?;
    assert!(matches!(first.get_or_compile(&broken), Err(EngineError::Compile { .. })));

    let counting = Arc::new(CountingCompiler::new());
    let second = CompileCache::with_location(counting.clone(), dir.path())?;
    assert!(matches!(second.get_or_compile(&broken), Err(EngineError::Compile { .. })));
    assert_eq!(counting.compilations(), 0);
    Ok(())
}

#[test]
fn test_stale_claim_is_taken_over() -> Result<()> {
    let dir = TempDir::new()?;
    let compiler = Arc::new(CountingCompiler::new());
    let cache = CompileCache::with_location(compiler.clone(), dir.path())?.with_timeouts(CacheTimeouts {
        poll_interval: Duration::from_millis(5),
        stale_after: Duration::from_millis(20),
        wait_limit: Duration::from_secs(30),
    });
    let signature = cache.signature(&square());
    fs::write(dir.path().join(format!("{signature}.pending")), "pid=0")?;
    thread::sleep(Duration::from_millis(60));

    cache.get_or_compile(&square())?;
    assert_eq!(compiler.compilations(), 1);
    assert!(!dir.path().join(format!("{signature}.pending")).exists());
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_racing_takeovers_of_a_stale_claim_compile_once() -> Result<()> {
    let dir = TempDir::new()?;
    let signature = CompileCache::new(Arc::new(ExprCompiler)).signature(&square());
    fs::write(dir.path().join(format!("{signature}.pending")), "pid=0")?;
    thread::sleep(Duration::from_millis(100));

    let compilers: Vec<_> = (0..4)
        .map(|_| Arc::new(CountingCompiler::new().with_delay(Duration::from_millis(150))))
        .collect();
    let barrier = Arc::new(Barrier::new(compilers.len()));
    let handles: Vec<_> = compilers
        .iter()
        .map(|compiler| {
            let cache = CompileCache::with_location(compiler.clone(), dir.path())
                .unwrap()
                .with_timeouts(CacheTimeouts {
                    poll_interval: Duration::from_millis(2),
                    stale_after: Duration::from_millis(60),
                    wait_limit: Duration::from_secs(30),
                });
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get_or_compile(&square()).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: usize = compilers.iter().map(|c| c.compilations()).sum();
    assert_eq!(total, 1);
    // Only the artifact is left: no claim and no tombstones.
    let names: Vec<String> = fs::read_dir(dir.path())?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(names, vec![format!("{signature}.artifact")]);
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_slow_compile_keeps_its_claim_fresh() -> Result<()> {
    let dir = TempDir::new()?;
    let timeouts = CacheTimeouts {
        poll_interval: Duration::from_millis(2),
        stale_after: Duration::from_millis(40),
        wait_limit: Duration::from_secs(30),
    };
    // Compiles for several stale periods.
    let slow = Arc::new(CountingCompiler::new().with_delay(Duration::from_millis(250)));
    let owner = CompileCache::with_location(slow.clone(), dir.path())?.with_timeouts(timeouts);
    let owner = thread::spawn(move || owner.get_or_compile(&square()).map(|k| k.eval(3.0)));

    let signature = CompileCache::new(Arc::new(ExprCompiler)).signature(&square());
    let pending = dir.path().join(format!("{signature}.pending"));
    while !pending.exists() {
        thread::sleep(Duration::from_millis(1));
    }
    let waiter = Arc::new(CountingCompiler::new());
    let kernel = CompileCache::with_location(waiter.clone(), dir.path())?
        .with_timeouts(timeouts)
        .get_or_compile(&square())?;

    assert_approx_eq!(kernel.eval(3.0), 9.0);
    assert_approx_eq!(owner.join().unwrap()?, 9.0);
    assert_eq!(slow.compilations(), 1);
    assert_eq!(waiter.compilations(), 0);
    Ok(())
}

struct PanickingCompiler;

impl KernelCompiler for PanickingCompiler {
    fn id(&self) -> &str {
        "panicking"
    }

    fn compile(&self, _source: &KernelSource) -> std::result::Result<Program, String> {
        panic!("code generator crashed")
    }
}

#[test]
fn test_compiler_panic_is_a_cached_compile_error() {
    let cache = CompileCache::new(Arc::new(PanickingCompiler));
    for _ in 0..2 {
        match cache.get_or_compile(&square()) {
            Err(EngineError::Compile { kernel, message, .. }) => {
                assert_eq!(kernel, "square");
                assert!(message.contains("code generator crashed"), "{message}");
            }
            other => panic!("expected a compile error, got {other:?}"),
        }
    }
    assert_eq!(cache.stats().compilations, 1);
}

#[test]
fn test_waiting_for_a_live_claim_times_out() -> Result<()> {
    let dir = TempDir::new()?;
    let compiler = Arc::new(CountingCompiler::new());
    let cache = CompileCache::with_location(compiler.clone(), dir.path())?.with_timeouts(CacheTimeouts {
        poll_interval: Duration::from_millis(5),
        stale_after: Duration::from_secs(3600),
        wait_limit: Duration::from_millis(50),
    });
    let signature = cache.signature(&square());
    fs::write(dir.path().join(format!("{signature}.pending")), "pid=0")?;

    let err = cache.get_or_compile(&square()).unwrap_err();
    assert!(matches!(err, EngineError::Worker(_)), "{err}");
    assert_eq!(compiler.compilations(), 0);
    Ok(())
}

#[test]
fn test_corrupt_artifact_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let cache = CompileCache::with_location(Arc::new(ExprCompiler), dir.path())?;
    let signature = cache.signature(&square());
    fs::write(dir.path().join(format!("{signature}.artifact")), b"not an artifact")?;
    assert!(cache.get_or_compile(&square()).is_err());
    Ok(())
}

#[test]
fn test_checksum_is_hex_sha256() {
    assert_eq!(
        compute_checksum(b""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}
