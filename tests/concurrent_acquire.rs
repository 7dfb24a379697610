//! First use of the process-wide interpreter from two adapters at once.
//!
//! Kept in its own test binary: the construction count is process-wide.

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use luadoop::bridge::{InterpreterHandle, Role, JOB_SETUP_SCRIPT_KEY};
use luadoop::host::local::MemoryContext;
use luadoop::host::{Configurable, Configuration, Datum, Mapper, RawComparator};
use luadoop::{ComparatorProxy, MapperProxy};
use tempfile::TempDir;

const SCRIPT: &str = r#"
LoadCount = (LoadCount or 0) + 1

Echo = luadoop.class()
function Echo:map(key, value, ctx) ctx:write(key, value) end

Reverse = luadoop.class()
function Reverse:compare(a, b)
  if a > b then return -1 elseif a < b then return 1 else return 0 end
end
"#;

#[test]
fn test_mapper_and_comparator_racing_share_one_runtime() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("setup.lua");
    fs::write(&script, SCRIPT).unwrap();

    let mut conf = Configuration::new();
    conf.set(JOB_SETUP_SCRIPT_KEY, script.display().to_string());
    conf.set(Role::Mapper.config_key(), "Echo");
    conf.set(Role::SortComparator.config_key(), "Reverse");

    let barrier = Arc::new(Barrier::new(2));

    let mapper_thread = {
        let barrier = Arc::clone(&barrier);
        let conf = conf.clone();
        thread::spawn(move || {
            barrier.wait();
            let mut mapper = MapperProxy::new();
            let mut ctx = MemoryContext::new(conf);
            mapper.setup(&mut ctx).unwrap();
            (mapper, ctx)
        })
    };
    let comparator_thread = {
        let barrier = Arc::clone(&barrier);
        let conf = conf.clone();
        thread::spawn(move || {
            barrier.wait();
            let mut comparator = ComparatorProxy::sort();
            comparator.set_conf(&conf).unwrap();
            comparator
        })
    };

    let (mut mapper, mut ctx) = mapper_thread.join().unwrap();
    let mut comparator = comparator_thread.join().unwrap();

    let mapper_runtime = mapper.instance().unwrap().interpreter();
    let comparator_runtime = comparator.instance().unwrap().interpreter();
    assert!(Arc::ptr_eq(mapper_runtime, comparator_runtime));
    assert_eq!(InterpreterHandle::runtimes_created(), 1);
    assert_eq!(mapper_runtime.live_bindings(), 2);
    assert_eq!(mapper_runtime.evaluate_datum("return LoadCount").unwrap(), Datum::Int(1));

    mapper.map(Datum::Int(0), Datum::text("x"), &mut ctx).unwrap();
    assert_eq!(comparator.compare(&Datum::Int(1), &Datum::Int(2)).unwrap(), 1);

    mapper.cleanup(&mut ctx).unwrap();
    comparator.close().unwrap();
    assert_eq!(InterpreterHandle::acquire().unwrap().live_bindings(), 0);
}
