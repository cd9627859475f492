//! Named-import checks for externalized modules

use crate::context::ImportMetadata;
use crate::fetch::{FetchResult, ModuleKind, ResolvedResult};
use crate::value::Namespace;
use crate::{ModuleError, Result};

/// Validate an externalized namespace against the bindings an importer
/// requested.
///
/// Only `dynamic-object` and `module` externals are processed; every other
/// kind, unknown included, passes through unchanged. Modules that attach
/// their exports at run time cannot be checked statically, so every
/// requested binding absent from the namespace is an error at import time.
/// When names were requested, the returned view also fails on reads of
/// bindings it does not provide.
pub fn process_import(
    namespace: Namespace,
    fetched: &ResolvedResult,
    metadata: &ImportMetadata,
) -> Result<Namespace> {
    let FetchResult::External { kind, .. } = &fetched.result else {
        return Ok(namespace);
    };
    if !matches!(kind, Some(ModuleKind::DynamicObject) | Some(ModuleKind::Module)) {
        return Ok(namespace);
    }

    check_missing_bindings(&namespace, &fetched.id, *kind, metadata)?;

    if metadata.names().is_empty() {
        // `import 'dep'` and `import * as dep` read nothing by name
        Ok(namespace)
    } else {
        Ok(namespace.guarded(&fetched.id))
    }
}

fn check_missing_bindings(
    namespace: &Namespace,
    module: &str,
    kind: Option<ModuleKind>,
    metadata: &ImportMetadata,
) -> Result<()> {
    if metadata.is_dynamic_import || kind == Some(ModuleKind::Module) {
        return Ok(());
    }

    let missing: Vec<String> = metadata
        .names()
        .iter()
        .filter(|name| !namespace.contains(name))
        .cloned()
        .collect();

    match missing.last() {
        Some(last) => Err(ModuleError::NamedExportNotFound {
            name: last.clone(),
            module: module.to_string(),
            missing,
        }),
        None => Ok(()),
    }
}
