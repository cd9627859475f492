//! Runtime tests: execution, caching, cycles and interop

mod common;

use common::{init_tracing, Counter, TestFetcher};
use fluentai_module_runner::fetch::ModuleKind;
use fluentai_module_runner::{
    ModuleContext, ModuleError, ModuleValue, Namespace, NativeRunner, Runtime, RuntimeConfig,
    RuntimeOptions,
};
use futures::future::join_all;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn runtime(fetcher: &TestFetcher, runner: &NativeRunner) -> Runtime {
    init_tracing();
    Runtime::new(RuntimeOptions::new(fetcher.clone()), runner.clone())
}

#[tokio::test]
async fn test_concurrent_requests_execute_once() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/a.ts", "a");
    let runner = NativeRunner::new();
    let counter = Counter::new();

    let c = counter.clone();
    runner.register("a", move |ctx: ModuleContext| {
        let c = c.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.export("count", json!(c.hit("a")))?;
            Ok(())
        }
    });

    let runtime = runtime(&fetcher, &runner);
    let results = join_all((0..8).map(|_| runtime.execute_url("/a.ts"))).await;

    assert_eq!(counter.get("a"), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Namespace::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(first.get_json("count").unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn test_cycle_observes_partial_namespace() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/a.ts", "a").inline("/b.ts", "b");
    let runner = NativeRunner::new();
    let counter = Counter::new();

    let c = counter.clone();
    runner.register("a", move |ctx: ModuleContext| {
        let c = c.clone();
        async move {
            c.hit("a");
            ctx.export("before", json!(true))?;
            ctx.import_module("/b.ts").await?;
            ctx.export("after", json!(true))?;
            Ok(())
        }
    });

    let seen_from_b = Arc::new(Mutex::new(None));
    let c = counter.clone();
    let seen = seen_from_b.clone();
    runner.register("b", move |ctx: ModuleContext| {
        let c = c.clone();
        let seen = seen.clone();
        async move {
            c.hit("b");
            let a = ctx.import_module("/a.ts").await?;
            ctx.export("saw_before", json!(a.contains("before")))?;
            ctx.export("saw_after", json!(a.contains("after")))?;
            *seen.lock() = Some(a);
            Ok(())
        }
    });

    let runtime = runtime(&fetcher, &runner);
    let a = runtime.execute_url("/a.ts").await.unwrap();
    let b = runtime.execute_url("/b.ts").await.unwrap();

    assert_eq!(counter.get("a"), 1);
    assert_eq!(counter.get("b"), 1);
    assert_eq!(b.get_json("saw_before").unwrap(), Some(json!(true)));
    assert_eq!(b.get_json("saw_after").unwrap(), Some(json!(false)));

    // The partial namespace B received is A's live export object
    let partial = seen_from_b.lock().clone().unwrap();
    assert!(Namespace::ptr_eq(&partial, &a));
    assert!(partial.contains("after"));
}

#[tokio::test]
async fn test_import_edges_are_recorded() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/main.ts", "main").inline("/dep.ts", "dep");
    let runner = NativeRunner::new();
    runner.register("main", |ctx: ModuleContext| async move {
        ctx.import_module("/dep.ts").await?;
        Ok(())
    });
    runner.register("dep", |_ctx: ModuleContext| async { Ok(()) });

    let runtime = runtime(&fetcher, &runner);
    runtime.execute_url("/main.ts").await.unwrap();

    let cache = runtime.module_cache();
    assert_eq!(cache.get_by_module_id("/main.ts").imports(), vec!["/dep.ts".to_string()]);
    assert_eq!(cache.get_by_module_id("/dep.ts").importers(), vec!["/main.ts".to_string()]);
    assert!(cache.is_imported("/dep.ts", "/main.ts"));
    assert_eq!(fetcher.requests()[1], ("/dep.ts".to_string(), Some("/main.ts".to_string())));
}

#[tokio::test]
async fn test_delete_forces_refetch_and_reexecution() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/a.ts", "a");
    let runner = NativeRunner::new();
    let counter = Counter::new();
    let c = counter.clone();
    runner.register("a", move |_ctx: ModuleContext| {
        c.hit("a");
        async { Ok(()) }
    });

    let runtime = runtime(&fetcher, &runner);
    let first = runtime.execute_url("/a.ts").await.unwrap();
    runtime.execute_url("/a.ts").await.unwrap();
    assert_eq!(counter.get("a"), 1);
    assert_eq!(fetcher.fetch_count("/a.ts"), 1);

    for expected in 2..=3 {
        assert!(runtime.module_cache().delete_by_module_id("/a.ts"));
        let again = runtime.execute_url("/a.ts").await.unwrap();
        assert!(!Namespace::ptr_eq(&first, &again));
        assert_eq!(counter.get("a"), expected);
        assert_eq!(fetcher.fetch_count("/a.ts"), expected);
    }
}

#[tokio::test]
async fn test_execution_error_marks_entry_evaluated() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/broken.ts", "broken");
    let runner = NativeRunner::new();
    let counter = Counter::new();
    let c = counter.clone();
    runner.register("broken", move |ctx: ModuleContext| {
        c.hit("broken");
        async move { Err(ModuleError::execution(ctx.module_id, "boom")) }
    });

    let runtime = runtime(&fetcher, &runner);
    let err = runtime.execute_url("/broken.ts").await.unwrap_err();
    assert!(matches!(err, ModuleError::Execution { ref message, .. } if message == "boom"));
    assert!(runtime.module_cache().get_by_module_id("/broken.ts").is_evaluated());

    // The settled failure is shared; the module is not retried until invalidated
    assert!(runtime.execute_url("/broken.ts").await.is_err());
    assert_eq!(counter.get("broken"), 1);
}

#[tokio::test]
async fn test_fetch_errors_surface_unchanged() {
    let runtime = runtime(&TestFetcher::new(), &NativeRunner::new());
    let err = runtime.execute_url("/missing.ts").await.unwrap_err();
    assert!(matches!(err, ModuleError::Fetch { ref id, .. } if id == "/missing.ts"));
}

#[tokio::test]
async fn test_missing_code_reports_importer() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/main.ts", "main").empty("/empty.ts");
    let runner = NativeRunner::new();
    runner.register("main", |ctx: ModuleContext| async move {
        ctx.import_module("/empty.ts").await?;
        Ok(())
    });

    let runtime = runtime(&fetcher, &runner);
    let err = runtime.execute_url("/main.ts").await.unwrap_err();
    match err {
        ModuleError::LoadFailed { id, importer } => {
            assert_eq!(id, "/empty.ts");
            assert_eq!(importer.as_deref(), Some("/main.ts"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_export_all_guards() {
    let fetcher = TestFetcher::new();
    fetcher
        .inline("/main.ts", "main")
        .inline("/self.ts", "self")
        .external("/lib.cjs", "file:///lib.cjs", Some(ModuleKind::DynamicObject));
    let runner = NativeRunner::new();
    runner.provide(
        "file:///lib.cjs",
        Namespace::from_values([("default", json!(1)), ("__esModule", json!(true)), ("foo", json!("x"))]),
    );
    runner.register("main", |ctx: ModuleContext| async move {
        let lib = ctx.import_module("/lib.cjs").await?;
        ctx.export_all_from(&ModuleValue::Namespace(lib));
        // Plain data objects are copied too, arrays are not
        ctx.export_all_from(&ModuleValue::Value(json!({ "bar": 2, "default": 3 })));
        ctx.export_all_from(&ModuleValue::Value(json!([1, 2])));
        Ok(())
    });
    runner.register("self", |ctx: ModuleContext| async move {
        ctx.export("x", json!(1))?;
        let me = ctx.import_module("/self.ts").await?;
        ctx.export_all_from(&ModuleValue::Namespace(me));
        Ok(())
    });

    let runtime = runtime(&fetcher, &runner);
    let main = runtime.execute_url("/main.ts").await.unwrap();
    assert_eq!(main.keys(), vec!["bar".to_string(), "foo".to_string()]);
    assert_eq!(main.get_json("foo").unwrap(), Some(json!("x")));

    let me = runtime.execute_url("/self.ts").await.unwrap();
    assert_eq!(me.keys(), vec!["x".to_string()]);
}

#[tokio::test]
async fn test_interop_guard_on_dynamic_object_external() {
    let fetcher = TestFetcher::new();
    fetcher
        .inline("/bad.ts", "bad")
        .inline("/good.ts", "good")
        .external("/dep.cjs", "file:///dep.cjs", Some(ModuleKind::DynamicObject));
    let runner = NativeRunner::new();
    runner.provide("file:///dep.cjs", Namespace::from_values([("present", json!(1))]));

    runner.register("bad", |ctx: ModuleContext| async move {
        ctx.import_named("/dep.cjs", &["present", "absent"]).await?;
        Ok(())
    });
    runner.register("good", |ctx: ModuleContext| async move {
        let dep = ctx.import_named("/dep.cjs", &["present"]).await?;
        ctx.export("present", dep.get_json("present")?.unwrap_or_default())?;
        let unrequested = dep.get("other");
        ctx.export("guarded", json!(matches!(unrequested, Err(ModuleError::ExportNotProvided { .. }))))?;
        Ok(())
    });

    let runtime = runtime(&fetcher, &runner);
    let err = runtime.execute_url("/bad.ts").await.unwrap_err();
    assert!(matches!(err, ModuleError::NamedExportNotFound { ref name, .. } if name == "absent"));

    let good = runtime.execute_url("/good.ts").await.unwrap();
    assert_eq!(good.get_json("present").unwrap(), Some(json!(1)));
    assert_eq!(good.get_json("guarded").unwrap(), Some(json!(true)));
}

#[tokio::test]
async fn test_unknown_and_network_externals_are_not_checked() {
    let fetcher = TestFetcher::new();
    fetcher
        .inline("/main.ts", "main")
        .external("/plain.js", "file:///plain.js", None)
        .external("/net.js", "https://cdn.example.com/net.js", Some(ModuleKind::Network));
    let runner = NativeRunner::new();
    runner.provide("file:///plain.js", Namespace::from_values([("present", json!(1))]));
    runner.provide("https://cdn.example.com/net.js", Namespace::from_values([("present", json!(2))]));

    runner.register("main", |ctx: ModuleContext| async move {
        let plain = ctx.import_named("/plain.js", &["present", "absent"]).await?;
        let net = ctx.import_named("/net.js", &["absent"]).await?;
        ctx.export("plain_absent", json!(plain.get("absent")?.is_none()))?;
        ctx.export("net_present", net.get_json("present")?.unwrap_or_default())?;
        Ok(())
    });

    let main = runtime(&fetcher, &runner).execute_url("/main.ts").await.unwrap();
    assert_eq!(main.get_json("plain_absent").unwrap(), Some(json!(true)));
    assert_eq!(main.get_json("net_present").unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_dynamic_import_resolves_relative_to_importer() {
    let fetcher = TestFetcher::new();
    fetcher
        .inline("/src/main.ts", "main")
        .inline("/src/lib/util.ts", "util");
    let runner = NativeRunner::new();
    runner.register("main", |ctx: ModuleContext| async move {
        let util = ctx.import_dynamic("./lib/util.ts").await?;
        ctx.export("util", util.get_json("name")?.unwrap_or_default())?;
        Ok(())
    });
    runner.register("util", |ctx: ModuleContext| async move {
        ctx.export("name", json!("util"))?;
        Ok(())
    });

    let runtime = runtime(&fetcher, &runner);
    let main = runtime.execute_url("/src/main.ts").await.unwrap();
    assert_eq!(main.get_json("util").unwrap(), Some(json!("util")));
    assert_eq!(fetcher.fetch_count("/src/lib/util.ts"), 1);
}

#[tokio::test]
async fn test_import_meta() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/src/app.ts", "app");
    let runner = NativeRunner::new();
    runner.register("app", |ctx: ModuleContext| async move {
        let meta = ctx.meta.clone();
        ctx.export("filename", json!(meta.filename))?;
        ctx.export("dirname", json!(meta.dirname))?;
        ctx.export("url", json!(meta.url))?;
        ctx.export("mode", meta.env_var("MODE").cloned().unwrap_or_default())?;
        ctx.export("api", meta.env_var("API").cloned().unwrap_or_default())?;
        ctx.export("hot", json!(meta.hot().is_some()))?;
        ctx.export("resolve", json!(meta.resolve("./x").is_err()))?;
        Ok(())
    });

    let mut config = RuntimeConfig::default();
    config
        .environment_variables
        .insert("API".to_string(), json!("https://example.test"));
    let runtime = Runtime::new(RuntimeOptions::new(fetcher.clone()).config(config), runner.clone());

    let app = runtime.execute_url("/src/app.ts").await.unwrap();
    assert_eq!(
        app.to_json(),
        json!({
            "api": "https://example.test",
            "dirname": "/src",
            "filename": "/src/app.ts",
            "hot": false,
            "mode": "development",
            "resolve": true,
            "url": "file:///src/app.ts",
        })
    );
}

#[tokio::test]
async fn test_request_stubs_skip_fetch_and_execution() {
    let fetcher = TestFetcher::new();
    let stub = Namespace::from_values([("stubbed", json!(true))]);
    let runtime = Runtime::new(
        RuntimeOptions::new(fetcher.clone()).stub("/virtual-stub", stub.clone()),
        NativeRunner::new(),
    );

    let ns = runtime.execute_url("/virtual-stub").await.unwrap();
    assert!(Namespace::ptr_eq(&ns, &stub));
    assert!(fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_entrypoints_and_clear_cache() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/main.ts", "noop").inline("/lib.ts", "noop");
    let runner = NativeRunner::new();
    runner.register("noop", |_ctx: ModuleContext| async { Ok(()) });

    let runtime = runtime(&fetcher, &runner);
    runtime.execute_entrypoint("/main.ts").await.unwrap();
    runtime.execute_entrypoint("/main.ts").await.unwrap();
    runtime.execute_url("/lib.ts").await.unwrap();
    assert_eq!(runtime.entrypoints(), vec!["/main.ts".to_string()]);
    assert_eq!(runtime.module_cache().len(), 2);

    runtime.clear_cache();
    assert!(runtime.entrypoints().is_empty());
    assert!(runtime.module_cache().is_empty());

    runtime.execute_url("/lib.ts").await.unwrap();
    assert_eq!(fetcher.fetch_count("/lib.ts"), 2);
}

#[tokio::test]
async fn test_closed_runtime_rejects_requests() {
    let fetcher = TestFetcher::new();
    fetcher.inline("/main.ts", "noop");
    let runner = NativeRunner::new();
    runner.register("noop", |_ctx: ModuleContext| async { Ok(()) });

    let runtime = runtime(&fetcher, &runner);
    runtime.close();
    assert!(runtime.is_closed());

    let err = runtime.execute_url("/main.ts").await.unwrap_err();
    assert!(matches!(err, ModuleError::RuntimeClosed));
}

#[tokio::test]
async fn test_source_map_from_cached_code() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let map = STANDARD.encode(r#"{"version":3,"sources":["app.ts"],"names":[],"mappings":"AAAA;AACA"}"#);
    let code = format!("noop\n//# sourceMappingURL=data:application/json;base64,{}", map);
    let fetcher = TestFetcher::new();
    fetcher.inline("/src/app.js", &code);
    let runner = NativeRunner::new();
    runner.register(&code, |_ctx: ModuleContext| async { Ok(()) });

    let runtime = runtime(&fetcher, &runner);
    runtime.execute_url("/src/app.js").await.unwrap();

    let decoded = runtime.module_cache().get_source_map("/src/app.js").unwrap().unwrap();
    let position = decoded.original_position_for(2, 0).unwrap();
    assert_eq!(position.source.as_deref(), Some("/src/app.ts"));
    assert_eq!(position.line, 2);

    // Memoized on the entry
    let again = runtime.module_cache().get_source_map("/src/app.js").unwrap().unwrap();
    assert!(Arc::ptr_eq(&decoded, &again));
}
