//! End-to-end dump scenarios through the public API.
//!
//! Each scenario registers module sources in a fresh session, builds a code
//! graph either statically by name or from a captured frame stack, and checks
//! the exact serialized dump.

use unravel::{
    build_codegraph, build_codegraph_for_name, check_requirements, BuildOptions, Frame,
    FrameStack, NullIntrospector, Session, UnravelError,
};

fn session_with(modules: &[(&str, &str)]) -> Session {
    let session = Session::new();
    for (name, source) in modules {
        session.register_module(*name, *source);
    }
    session
}

fn static_dump(session: &Session, module: &str, name: &str) -> String {
    let options = BuildOptions::default();
    let graph = build_codegraph_for_name(session, &NullIntrospector, module, name, &options)
        .unwrap();
    graph.dumps().unwrap()
}

// ============================================================================
// Static dumps
// ============================================================================

#[test]
fn function_dump_carries_its_free_variables() {
    let session = session_with(&[(
        "__main__",
        "x = 100\n\ndef test_func():\n    return x\n",
    )]);
    assert_eq!(
        static_dump(&session, "__main__", "test_func"),
        "x = 100\n\n\ndef test_func():\n    return x\n"
    );
}

#[test]
fn assignment_chains_dump_in_dependency_order() {
    let session = session_with(&[("__main__", "x = 1\ny = x + 1\nz = y + x\n")]);
    assert_eq!(
        static_dump(&session, "__main__", "z"),
        "x = 1\n\n\ny = x + 1\n\n\nz = y + x\n"
    );
}

#[test]
fn builtins_never_become_nodes() {
    let session = session_with(&[(
        "__main__",
        "def shout(msg):\n    return str(msg).upper()\n",
    )]);
    assert_eq!(
        static_dump(&session, "__main__", "shout"),
        "def shout(msg):\n    return str(msg).upper()\n"
    );
}

#[test]
fn imports_are_kept_as_imports() {
    let session = session_with(&[(
        "__main__",
        "import math\n\ndef area(r):\n    return math.pi * r * r\n",
    )]);
    assert_eq!(
        static_dump(&session, "__main__", "area"),
        "import math\n\n\ndef area(r):\n    return math.pi * r * r\n"
    );
}

#[test]
fn full_dump_modules_are_inlined_from_source() {
    let session = session_with(&[
        (
            "__main__",
            "from helpers import helper\n\ndef run(v):\n    return helper(v)\n",
        ),
        ("helpers", "def helper(v):\n    return v + 1\n"),
    ]);
    let options = BuildOptions {
        strict: false,
        full_dump_module_names: vec!["helpers".to_string()],
    };
    let graph =
        build_codegraph_for_name(&session, &NullIntrospector, "__main__", "run", &options)
            .unwrap();
    assert_eq!(
        graph.dumps().unwrap(),
        "def helper(v):\n    return v + 1\n\n\ndef run(v):\n    return helper(v)\n"
    );
}

#[test]
fn strict_mode_fails_on_unresolved_names() {
    let session = session_with(&[("__main__", "def f():\n    return phantom\n")]);
    let options = BuildOptions {
        strict: true,
        full_dump_module_names: Vec::new(),
    };
    let err = build_codegraph_for_name(&session, &NullIntrospector, "__main__", "f", &options)
        .unwrap_err();
    assert!(matches!(err, UnravelError::NameNotFound { .. }));
}

#[test]
fn lenient_mode_drops_unresolved_names() {
    let session = session_with(&[("__main__", "def f():\n    return phantom\n")]);
    assert_eq!(
        static_dump(&session, "__main__", "f"),
        "def f():\n    return phantom\n"
    );
}

#[test]
fn dumps_is_idempotent() {
    let session = session_with(&[("__main__", "x = 1\ny = x + 1\n")]);
    let options = BuildOptions::default();
    let graph =
        build_codegraph_for_name(&session, &NullIntrospector, "__main__", "y", &options)
            .unwrap();
    let first = graph.dumps().unwrap();
    let second = graph.dumps().unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// Frame-capture dumps
// ============================================================================

const CAPTURE_MODULE: &str = "\
x = 1

def make(bip):
    return grab(bip + x)

result = make(41)
";

#[test]
fn captured_expression_dumps_with_parameter_bindings() {
    let session = session_with(&[("__main__", CAPTURE_MODULE)]);
    let stack = FrameStack::new(vec![
        Frame::new("__main__", "make", 4),
        Frame::new("__main__", "<module>", 6),
    ]);
    let options = BuildOptions::default();
    let graph =
        build_codegraph(&session, &NullIntrospector, &stack, "grab", Some("y"), &options)
            .unwrap();
    assert_eq!(
        graph.dumps().unwrap(),
        "bip = 41\n\n\nx = 1\n\n\ny = bip + x\n"
    );
}

#[test]
fn module_level_capture_resolves_against_toplevel() {
    let session = session_with(&[("__main__", "x = 7\nresult = grab(x + 1)\n")]);
    let stack = FrameStack::new(vec![Frame::new("__main__", "<module>", 2)]);
    let options = BuildOptions::default();
    let graph =
        build_codegraph(&session, &NullIntrospector, &stack, "grab", Some("y"), &options)
            .unwrap();
    assert_eq!(graph.dumps().unwrap(), "x = 7\n\n\ny = x + 1\n");
}

#[test]
fn capture_threads_through_a_three_frame_call_chain() {
    let session = session_with(&[(
        "__main__",
        "\
b = 1

def nested_frame(a):
    return grab(a + b)

def chain_nested(x=5):
    return nested_frame(x)

result = chain_nested(x=5)
",
    )]);
    let stack = FrameStack::new(vec![
        Frame::new("__main__", "nested_frame", 4),
        Frame::new("__main__", "chain_nested", 7),
        Frame::new("__main__", "<module>", 9),
    ]);
    let options = BuildOptions::default();
    let graph =
        build_codegraph(&session, &NullIntrospector, &stack, "grab", Some("y"), &options)
            .unwrap();
    assert_eq!(
        graph.dumps().unwrap(),
        "b = 1\n\n\nx = 5\n\n\na = x\n\n\ny = a + b\n"
    );
}

#[test]
fn one_shot_dumps_matches_the_two_step_build() {
    let session = session_with(&[("__main__", CAPTURE_MODULE)]);
    let stack = FrameStack::new(vec![
        Frame::new("__main__", "make", 4),
        Frame::new("__main__", "<module>", 6),
    ]);
    let options = BuildOptions::default();
    let one_shot =
        unravel::dumps(&session, &NullIntrospector, &stack, "grab", Some("y"), &options)
            .unwrap();
    assert_eq!(one_shot, "bip = 41\n\n\nx = 1\n\n\ny = bip + x\n");
}

// ============================================================================
// Requirements
// ============================================================================

struct MapScanner;

impl unravel::RequirementsScanner for MapScanner {
    fn scan(
        &self,
        modules: &[String],
    ) -> std::result::Result<Vec<String>, unravel::RequirementError> {
        modules
            .iter()
            .map(|module| match module.as_str() {
                "numpy" => Ok("numpy==1.26.4".to_string()),
                other => Err(unravel::RequirementError::NotFound {
                    package: other.to_string(),
                }),
            })
            .collect()
    }
}

#[test]
fn graph_imports_map_to_requirements() {
    let session = session_with(&[(
        "__main__",
        "import numpy\n\ndef mean(v):\n    return numpy.mean(v)\n",
    )]);
    let options = BuildOptions::default();
    let graph =
        build_codegraph_for_name(&session, &NullIntrospector, "__main__", "mean", &options)
            .unwrap();
    let requirements = check_requirements(&graph, &MapScanner, true).unwrap();
    assert_eq!(requirements, vec!["numpy==1.26.4"]);
}
