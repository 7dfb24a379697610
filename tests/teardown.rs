//! Teardown of the process-wide interpreter.
//!
//! Kept in its own test binary so no other test shares the global handle.

use std::fs;

use luadoop::bridge::{InterpreterHandle, JOB_SETUP_SCRIPT_KEY};
use luadoop::host::local::MemoryContext;
use luadoop::host::{Configuration, Mapper};
use luadoop::MapperProxy;
use tempfile::TempDir;

#[test]
fn test_teardown_refuses_live_bindings_then_releases() {
    assert!(!InterpreterHandle::teardown().unwrap());

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("setup.lua");
    fs::write(&script, "Echo = luadoop.class()\nfunction Echo:map(k, v, ctx) ctx:write(k, v) end\n").unwrap();

    let mut conf = Configuration::new();
    conf.set(JOB_SETUP_SCRIPT_KEY, script.display().to_string());
    conf.set("luadoop.mapper", "Echo");
    let mut ctx = MemoryContext::new(conf);

    let mut mapper = MapperProxy::new();
    mapper.setup(&mut ctx).unwrap();
    let first = InterpreterHandle::acquire().unwrap();
    assert_eq!(first.live_bindings(), 1);

    let err = InterpreterHandle::teardown().unwrap_err();
    assert!(err.is_binding());

    mapper.cleanup(&mut ctx).unwrap();
    assert_eq!(first.live_bindings(), 0);
    assert!(InterpreterHandle::teardown().unwrap());
    assert!(!InterpreterHandle::teardown().unwrap());

    let second = InterpreterHandle::acquire().unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(InterpreterHandle::runtimes_created(), 2);
}
