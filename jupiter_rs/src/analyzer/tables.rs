//! Versioned recognition tables used by the usage-confidence ruleset.
//!
//! These sets are part of the public contract: given identical source
//! bytes, analyzers must produce identical tags, so additions here are
//! minor-version changes and the contents are pinned by tests.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Version of the recognition tables. Bump the minor on additions.
pub const TABLES_VERSION: &str = "1.1";

/// Decorator tags recognized exactly (dotted rendering).
static FRAMEWORK_DECORATOR_EXACT: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "task",
        "shared_task",
        "celery.task",
        "app.task",
        "pytest.fixture",
        "fixture",
        "click.command",
        "click.group",
        "cli.command",
        "cli.group",
        "receiver",
        "app.errorhandler",
        "app.before_request",
        "app.after_request",
        "validator",
        "property",
        "cached_property",
    ])
});

/// Final attribute segments that mark a route decorator when the tag has
/// an object prefix (`router.get`, `app.route`, `blueprint.post`, ...).
static ROUTE_VERBS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "route",
        "get",
        "post",
        "put",
        "delete",
        "patch",
        "head",
        "options",
        "websocket",
    ])
});

/// Names treated as used regardless of call evidence.
static KNOWN_USED_EXACT: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "main",
        "to_dict",
        "to_json",
        "from_dict",
        "from_json",
        "setUp",
        "tearDown",
        "setUpClass",
        "tearDownClass",
        "run",
        "handle",
    ])
});

/// Method names whose call sites register a symbol dynamically when
/// passed a literal symbol argument.
static DYNAMIC_REGISTRATION_METHODS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "set_defaults",
        "add_command",
        "subscribe",
        "register",
        "register_function",
        "add_handler",
        "add_url_rule",
        "connect",
    ])
});

/// Whether a dotted decorator tag is a recognized framework decorator.
pub fn is_framework_decorator(tag: &str) -> bool {
    if FRAMEWORK_DECORATOR_EXACT.contains(tag) {
        return true;
    }
    // Route decorators: object prefix + verb segment.
    if let Some((prefix, verb)) = tag.rsplit_once('.') {
        if !prefix.is_empty() && ROUTE_VERBS.contains(verb) {
            return true;
        }
        // pytest.mark.* carries an extra segment.
        if prefix == "pytest.mark" {
            return true;
        }
    }
    false
}

/// Whether a symbol name matches the known-used table.
pub fn is_known_used_name(name: &str) -> bool {
    if name.len() > 4 && name.starts_with("__") && name.ends_with("__") {
        return true;
    }
    if KNOWN_USED_EXACT.contains(name) {
        return true;
    }
    name.starts_with("test_") || name.starts_with("on_") || name.starts_with("do_")
}

/// Whether a method name is a recognized dynamic-registration call.
pub fn is_dynamic_registration_method(method: &str) -> bool {
    DYNAMIC_REGISTRATION_METHODS.contains(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_decorators_need_an_object_prefix() {
        assert!(is_framework_decorator("router.get"));
        assert!(is_framework_decorator("app.route"));
        assert!(is_framework_decorator("blueprint.post"));
        // A bare verb is not a route decorator.
        assert!(!is_framework_decorator("get"));
        assert!(!is_framework_decorator(".get"));
    }

    #[test]
    fn exact_decorator_table_is_pinned() {
        for tag in [
            "task",
            "shared_task",
            "celery.task",
            "pytest.fixture",
            "click.command",
        ] {
            assert!(is_framework_decorator(tag), "{tag} should be recognized");
        }
        assert!(is_framework_decorator("pytest.mark.asyncio"));
        assert!(!is_framework_decorator("functools.wraps"));
    }

    #[test]
    fn known_used_names_cover_dunders_and_prefixes() {
        assert!(is_known_used_name("__init__"));
        assert!(is_known_used_name("__repr__"));
        assert!(is_known_used_name("to_dict"));
        assert!(is_known_used_name("main"));
        assert!(is_known_used_name("test_scan_works"));
        assert!(is_known_used_name("on_message"));
        assert!(!is_known_used_name("helper"));
        // `__x` alone is not a dunder
        assert!(!is_known_used_name("__x"));
    }

    #[test]
    fn dynamic_registration_table_is_pinned() {
        for method in ["set_defaults", "add_command", "subscribe", "register"] {
            assert!(is_dynamic_registration_method(method));
        }
        assert!(!is_dynamic_registration_method("append"));
    }
}
