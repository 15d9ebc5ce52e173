use std::collections::HashMap;

use pretty_assertions::assert_eq;
use tinja::{render, Environment, Value};

fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn render_ok(source: &str, pairs: &[(&str, Value)]) -> String {
    render(source, vars(pairs)).expect("template should render")
}

#[test]
fn tag_free_template_roundtrips_exactly() {
    let source = "no tags\n  keep indentation\n\nand the trailing newline\n";
    assert_eq!(render_ok(source, &[]), source);
}

#[test]
fn comments_disappear_without_touching_surrounding_text() {
    assert_eq!(render_ok("a{# gone {% for %} #}b", &[]), "ab");
}

#[test]
fn long_runs_of_adjacent_comments_render_to_nothing() {
    // every comment is consumed in the tokenizer's flat loop, so the
    // count can grow without bounding anything else
    let source = "{#c#}".repeat(50_000);
    assert_eq!(render_ok(&source, &[]), "");
}

#[test]
fn constant_arithmetic() {
    assert_eq!(render_ok("{{ 1 + 2 }}", &[]), "3");
    assert_eq!(render_ok("{{ 7 // 2 }}", &[]), "3");
    assert_eq!(render_ok("{{ -7 // 2 }}", &[]), "-4");
    assert_eq!(render_ok("{{ 1 / 2 }}", &[]), "0.5");
    assert_eq!(render_ok("{{ 2 ** 10 }}", &[]), "1024");
    assert_eq!(render_ok("{{ -7 % 3 }}", &[]), "2");
    // a whole float still renders with its decimal point
    assert_eq!(render_ok("{{ 6.0 / 2 }}", &[]), "3.0");
}

#[test]
fn adjacent_string_literals_concatenate() {
    assert_eq!(render_ok(r#"{{ "a" 'b' "c" }}"#, &[]), "abc");
}

#[test]
fn if_elif_else() {
    let source = "{% if n > 10 %}big{% elif n > 5 %}medium{% else %}small{% endif %}";
    assert_eq!(render_ok(source, &[("n", Value::Int(20))]), "big");
    assert_eq!(render_ok(source, &[("n", Value::Int(7))]), "medium");
    assert_eq!(render_ok(source, &[("n", Value::Int(1))]), "small");
}

#[test]
fn for_loop_over_list_and_string() {
    let items = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(
        render_ok("{% for i in items %}{{ i }}{% endfor %}", &[("items", items)]),
        "123"
    );
    assert_eq!(
        render_ok("{% for c in word %}{{ c }}.{% endfor %}", &[("word", Value::from("ab"))]),
        "a.b."
    );
}

#[test]
fn for_else_runs_only_when_nothing_iterated() {
    let source = "{% for i in items %}{{ i }}{% else %}empty{% endfor %}";
    assert_eq!(
        render_ok(source, &[("items", Value::List(vec![Value::Int(1)]))]),
        "1"
    );
    assert_eq!(render_ok(source, &[("items", Value::List(vec![]))]), "empty");
}

#[test]
fn loop_filter_skips_items_before_the_body() {
    let items = Value::List((1..=5).map(Value::Int).collect());
    assert_eq!(
        render_ok(
            "{% for i in items if i > 2 %}{{ i }}{% endfor %}",
            &[("items", items.clone())]
        ),
        "345"
    );
    // a filter that rejects everything falls through to else
    assert_eq!(
        render_ok(
            "{% for i in items if i > 9 %}{{ i }}{% else %}none{% endfor %}",
            &[("items", items)]
        ),
        "none"
    );
}

#[test]
fn tuple_targets_unpack_each_item() {
    let pairs = Value::List(vec![
        Value::List(vec![Value::from("a"), Value::Int(1)]),
        Value::List(vec![Value::from("b"), Value::Int(2)]),
    ]);
    assert_eq!(
        render_ok(
            "{% for k, v in pairs %}{{ k }}={{ v }};{% endfor %}",
            &[("pairs", pairs)]
        ),
        "a=1;b=2;"
    );
}

#[test]
fn unpack_mismatch_is_a_render_error() {
    let pairs = Value::List(vec![Value::List(vec![Value::Int(1)])]);
    let err = render(
        "{% for a, b in pairs %}x{% endfor %}",
        vars(&[("pairs", pairs)]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("unpack"));
}

#[test]
fn loop_variable_does_not_leak_past_the_loop() {
    let source = "{% for x in items %}{{ x }}{% endfor %}{{ x }}";
    let err = render(
        source,
        vars(&[
            ("items", Value::List(vec![Value::Int(1)])),
        ]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("'x' is undefined"));
}

#[test]
fn nested_with_scopes_shadow_and_restore() {
    let source = "{% with a = 1 %}{% with a = 2 %}{{ a }}{% endwith %}{{ a }}{% endwith %}";
    assert_eq!(render_ok(source, &[]), "21");
}

#[test]
fn with_values_come_from_the_enclosing_scope() {
    let source = "{% with a = b %}{{ a }}{% endwith %}";
    assert_eq!(render_ok(source, &[("b", Value::from("outer"))]), "outer");
}

#[test]
fn with_tuple_target_unpacks() {
    let source = "{% with x, y = pair %}{{ x }}{{ y }}{% endwith %}";
    assert_eq!(
        render_ok(
            source,
            &[("pair", Value::List(vec![Value::Int(1), Value::Int(2)]))]
        ),
        "12"
    );
}

#[test]
fn for_loop_sees_enclosing_names() {
    let source = "{% for i in items %}{{ prefix }}{{ i }}{% endfor %}";
    assert_eq!(
        render_ok(
            source,
            &[
                ("items", Value::List(vec![Value::Int(1), Value::Int(2)])),
                ("prefix", Value::from("#")),
            ]
        ),
        "#1#2"
    );
}

#[test]
fn chained_comparisons_evaluate_pairwise() {
    assert_eq!(render_ok("{{ 1 < 2 < 3 }}", &[]), "true");
    assert_eq!(render_ok("{{ 1 < 3 < 2 }}", &[]), "false");
    assert_eq!(
        render_ok("{{ 1 <= n <= 10 }}", &[("n", Value::Int(5))]),
        "true"
    );
}

#[test]
fn membership_operators() {
    let items = Value::List(vec![Value::Int(1), Value::Int(2)]);
    assert_eq!(render_ok("{{ 2 in xs }}", &[("xs", items.clone())]), "true");
    assert_eq!(render_ok("{{ 3 not in xs }}", &[("xs", items)]), "true");
    assert_eq!(render_ok("{{ 'ell' in 'hello' }}", &[]), "true");
}

#[test]
fn attribute_and_item_access_on_maps() {
    let user = Value::Map(vec![
        (Value::from("name"), Value::from("ada")),
        (Value::from("age"), Value::Int(36)),
    ]);
    assert_eq!(
        render_ok("{{ user.name }} is {{ user['age'] }}", &[("user", user)]),
        "ada is 36"
    );
}

#[test]
fn negative_indexing_and_slices() {
    let items = Value::List((0..5).map(Value::Int).collect());
    assert_eq!(render_ok("{{ xs[-1] }}", &[("xs", items.clone())]), "4");
    assert_eq!(
        render_ok("{{ xs[1:3] }}", &[("xs", items.clone())]),
        "[1, 2]"
    );
    assert_eq!(
        render_ok("{{ xs[::-1] }}", &[("xs", items.clone())]),
        "[4, 3, 2, 1, 0]"
    );
    // out-of-range bounds clamp
    assert_eq!(render_ok("{{ xs[3:100] }}", &[("xs", items)]), "[3, 4]");
    assert_eq!(render_ok("{{ 'hello'[1:4] }}", &[]), "ell");
}

#[test]
fn undefined_is_harmless_until_used() {
    // boolean tests and equality never raise
    assert_eq!(render_ok("{% if ghost %}yes{% else %}no{% endif %}", &[]), "no");
    assert_eq!(render_ok("{{ ghost == other_ghost }}", &[]), "true");
    assert_eq!(render_ok("{{ ghost != 1 }}", &[]), "true");
    assert_eq!(render_ok("{{ not ghost }}", &[]), "true");

    // output, arithmetic and iteration raise with the name in the message
    for source in ["{{ ghost }}", "{{ ghost + 1 }}", "{% for x in ghost %}{% endfor %}"] {
        let err = render(source, HashMap::new()).unwrap_err();
        assert!(
            err.to_string().contains("'ghost' is undefined"),
            "{} gave: {}",
            source,
            err
        );
    }
}

#[test]
fn undefined_inside_a_container_raises_on_output() {
    // wrapping an undefined value in a literal must not launder it
    // into empty text
    for source in ["{{ [ghost] }}", "{{ {'k': ghost} }}", "{{ [[1, ghost]] }}"] {
        let err = render(source, HashMap::new()).unwrap_err();
        assert!(
            err.to_string().contains("'ghost' is undefined"),
            "{} gave: {}",
            source,
            err
        );
    }
}

#[test]
fn missing_attribute_reports_the_base_type_when_used() {
    let err = render(
        "{{ user.missing + 1 }}",
        vars(&[("user", Value::Map(vec![]))]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("has no attribute or item 'missing'"));
}

#[test]
fn attribute_access_on_an_undefined_base_raises() {
    let err = render("{{ ghost.attr }}", HashMap::new()).unwrap_err();
    assert!(err.to_string().contains("'ghost' is undefined"));
}

#[test]
fn calls_always_fail_at_render_time() {
    let err = render("{{ f() }}", vars(&[("f", Value::Int(1))])).unwrap_err();
    assert!(err.to_string().contains("not callable"));
    let err = render("{{ f() }}", HashMap::new()).unwrap_err();
    assert!(err.to_string().contains("'f' is undefined"));
}

#[test]
fn logic_operators_return_the_deciding_operand() {
    assert_eq!(render_ok("{{ 0 or 'fallback' }}", &[]), "fallback");
    assert_eq!(render_ok("{{ 'first' or 'second' }}", &[]), "first");
    assert_eq!(render_ok("{{ 1 and 'second' }}", &[]), "second");
    // short-circuit keeps the undefined right side untouched
    assert_eq!(render_ok("{{ 'left' or ghost }}", &[]), "left");
}

#[test]
fn none_renders_as_empty_and_bools_lowercase() {
    assert_eq!(render_ok("[{{ none }}]", &[]), "[]");
    assert_eq!(render_ok("{{ true }} {{ False }}", &[]), "true false");
}

#[test]
fn dict_literals_and_nested_containers() {
    assert_eq!(
        render_ok("{{ {'a': 1, 'b': [2, 3]}['b'][0] }}", &[]),
        "2"
    );
}

#[test]
fn blocks_render_inline_and_standalone() {
    let env = Environment::new();
    let tpl = env
        .compile("[{% block title %}{{ name }}{% endblock %}]")
        .unwrap();
    assert_eq!(
        tpl.render(vars(&[("name", Value::from("t"))])).unwrap(),
        "[t]"
    );
    assert_eq!(
        tpl.render_block("title", vars(&[("name", Value::from("solo"))]))
            .unwrap(),
        "solo"
    );
}

#[test]
fn autoescape_escapes_interpolations_only() {
    let env = Environment::with_autoescape(true);
    let tpl = env.compile("<p>{{ v }} & {{ 'a<b' }}</p>").unwrap();
    assert_eq!(
        tpl.render(vars(&[("v", Value::from("<script>"))])).unwrap(),
        "<p>&lt;script&gt; & a&lt;b</p>"
    );
}

#[test]
fn extends_parses_and_renders_nothing() {
    assert_eq!(render_ok("a{% extends 'base.html' %}b", &[]), "ab");
}
