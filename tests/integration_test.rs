// Integration tests for the full pipeline
//
// These exercise the lexer, parser, evaluator, and compiler together on
// complete expressions, including the behavioral guarantees the engine makes:
// macro binding transparency, short-circuit safety, and constant folding.

use verdict::{compile, evaluate, parse, value, Context, EvalError, Value};

fn ctx_with(vars: &[(&str, Value)]) -> Context {
    let mut ctx = Context::new();
    for (name, value) in vars {
        ctx.set(*name, value.clone());
    }
    ctx
}

#[test]
fn test_arithmetic_precedence() {
    let mut ctx = Context::new();
    assert_eq!(evaluate("1 + 2 * 3", &mut ctx).unwrap(), Value::Int(7));
    assert_eq!(
        evaluate("(1 + 2) * 3", &mut ctx).unwrap(),
        Value::Int(9)
    );
}

#[test]
fn test_policy_rule() {
    let mut ctx = ctx_with(&[("age", value!(30)), ("isActive", value!(true))]);
    assert_eq!(
        evaluate("age > 25 && isActive", &mut ctx).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn test_filter_sum_both_forms() {
    let mut ctx = ctx_with(&[("numbers", value!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]))]);
    assert_eq!(
        evaluate("sum(filter(n, numbers, n > 5))", &mut ctx).unwrap(),
        Value::Int(40)
    );
    assert_eq!(
        evaluate("numbers.filter(n, n > 5).sum()", &mut ctx).unwrap(),
        Value::Int(40)
    );
}

#[test]
fn test_macro_chain_over_records() {
    let mut ctx = ctx_with(&[
        (
            "users",
            value!([
                {"name": "Alice", "salary": 85000.0, "dept": "Eng"},
                {"name": "Bob", "salary": 45000.0, "dept": "Mkt"}
            ]),
        ),
        ("threshold", value!(50000.0)),
    ]);
    assert_eq!(
        evaluate(
            "users.filter(u, u.salary > threshold).map(u, u.name.upper()).join(', ')",
            &mut ctx
        )
        .unwrap(),
        Value::string("ALICE")
    );
}

#[test]
fn test_like_patterns() {
    let mut ctx = Context::new();
    for (expr, expected) in [
        ("'ab%' like 'ab%'", true),
        ("'abcd' like 'a_cd'", true),
        ("'abcd' like 'a%d'", true),
        ("'abcd' like 'a_d'", false),
    ] {
        assert_eq!(
            evaluate(expr, &mut ctx).unwrap(),
            Value::Bool(expected),
            "{}",
            expr
        );
    }
}

#[test]
fn test_comprehension_leaves_variable_unbound() {
    let mut ctx = Context::new();
    assert_eq!(
        evaluate("[x | x in [1, 2, 3]]", &mut ctx).unwrap(),
        value!([1, 2, 3])
    );
    assert_eq!(ctx.get("x"), None);
}

// ── Universal properties ─────────────────────────────────────────────────────

#[test]
fn test_parse_stability() {
    let sources = [
        "1 + 2 * 3",
        "xs.filter(n, n > 2).map(n, n * n)",
        "v between 1 and 9 ? 'in' : 'out'",
        "[a + b | a in xs, a != b]",
    ];
    for src in sources {
        let first = parse(src).unwrap();
        let second = parse(src).unwrap();
        assert_eq!(first, second, "{}", src);

        let mut c1 = ctx_with(&[("xs", value!([1, 2, 3])), ("v", value!(4)), ("a", value!(1)), ("b", value!(2))]);
        let mut c2 = ctx_with(&[("xs", value!([1, 2, 3])), ("v", value!(4)), ("a", value!(1)), ("b", value!(2))]);
        assert_eq!(
            first.evaluate(&mut c1).unwrap(),
            second.evaluate(&mut c2).unwrap(),
            "{}",
            src
        );
    }
}

#[test]
fn test_macro_transparency() {
    // Previously unbound: unbound after, even when the macro errors
    let mut ctx = ctx_with(&[("xs", value!([1, 2, 3]))]);
    evaluate("xs.map(m, m + 1)", &mut ctx).unwrap();
    assert_eq!(ctx.get("m"), None);
    assert!(evaluate("xs.map(m, m.nope())", &mut ctx).is_err());
    assert_eq!(ctx.get("m"), None);

    // Previously bound: the binding survives, even when the macro errors
    ctx.set("m", value!("kept"));
    evaluate("xs.filter(m, m > 1)", &mut ctx).unwrap();
    assert_eq!(ctx.get("m"), Some(&value!("kept")));
    assert!(evaluate("xs.map(m, m.nope())", &mut ctx).is_err());
    assert_eq!(ctx.get("m"), Some(&value!("kept")));

    // Nested shadowing restores layer by layer
    ctx.set("n", value!(0));
    evaluate("xs.map(n, [n * 10 | n in xs])", &mut ctx).unwrap();
    assert_eq!(ctx.get("n"), Some(&value!(0)));
}

#[test]
fn test_short_circuit_suppresses_errors() {
    let mut ctx = Context::new();
    ctx.register_function("raises", |_| {
        Err(EvalError::TypeError("should never run".to_string()))
    });

    assert_eq!(
        evaluate("false && raises()", &mut ctx).unwrap(),
        Value::Bool(false)
    );
    assert_eq!(
        evaluate("true || raises()", &mut ctx).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        evaluate("false ? raises() : 'ok'", &mut ctx).unwrap(),
        Value::string("ok")
    );
    // The taken side still surfaces the error
    assert!(evaluate("true && raises()", &mut ctx).is_err());
}

#[test]
fn test_structural_equality() {
    let seq = value!([1, "two", [3.0, null]]);
    assert_eq!(seq, seq.clone());
    let rec = value!({"a": [1, 2], "b": {"c": true}});
    assert_eq!(rec, rec.clone());

    let mut ctx = ctx_with(&[("v", rec)]);
    assert_eq!(
        evaluate("v == {'b': {'c': true}, 'a': [1, 2]}", &mut ctx).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn test_constant_folding_matches_direct_evaluation() {
    let sources = ["1 + 2 * 3", "upper('ok') + '!'", "[n | n in [1, 2], n > 1]"];
    for src in sources {
        let compiled = compile(src).unwrap();
        let direct = parse(src).unwrap().evaluate(&mut Context::new()).unwrap();
        assert_eq!(
            compiled.evaluate(&mut Context::new()).unwrap(),
            direct,
            "{}",
            src
        );
        // The same compiled object keeps returning the same value
        assert_eq!(compiled.evaluate(&mut Context::new()).unwrap(), direct);
    }
}

#[test]
fn test_compile_cache_identity() {
    let a = compile("'cache' + ' me'").unwrap();
    let b = compile("'cache' + ' me'").unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
}

#[test]
fn test_between_identity() {
    let mut ctx = Context::new();
    let cases = [
        ("3", "1", "5"),
        ("1", "1", "5"),
        ("5", "1", "5"),
        ("0", "1", "5"),
        ("9", "1", "5"),
        ("'m'", "'a'", "'z'"),
        ("'A'", "'a'", "'z'"),
        ("2.5", "1", "5"),
    ];
    for (v, lo, hi) in cases {
        let between = evaluate(&format!("{} between {} and {}", v, lo, hi), &mut ctx).unwrap();
        let spelled = evaluate(&format!("{} >= {} && {} <= {}", v, lo, v, hi), &mut ctx).unwrap();
        assert_eq!(between, spelled, "{} between {} and {}", v, lo, hi);
    }
}

#[test]
fn test_comprehension_equals_filter_then_map() {
    let mut c1 = ctx_with(&[("s", value!([1, 2, 3, 4, 5, 6]))]);
    let mut c2 = ctx_with(&[("s", value!([1, 2, 3, 4, 5, 6]))]);
    let comprehension = evaluate("[x * x | x in s, x % 2 == 0]", &mut c1).unwrap();
    let spelled = evaluate("s.filter(x, x % 2 == 0).map(x, x * x)", &mut c2).unwrap();
    assert_eq!(comprehension, spelled);
}

// ── Broader end-to-end coverage ──────────────────────────────────────────────

#[test]
fn test_nested_data_extraction() {
    let mut ctx = ctx_with(&[(
        "order",
        value!({
            "id": "ORD-1",
            "items": [
                {"sku": "laptop", "price": 1000, "qty": 1},
                {"sku": "mouse", "price": 25, "qty": 2}
            ],
            "customer": {"name": "Alice", "tier": "premium"}
        }),
    )]);

    assert_eq!(
        evaluate("order.customer.name", &mut ctx).unwrap(),
        Value::string("Alice")
    );
    assert_eq!(
        evaluate("order.items.map(i, i.price * i.qty).sum()", &mut ctx).unwrap(),
        Value::Int(1050)
    );
    assert_eq!(
        evaluate("order.items[0].sku", &mut ctx).unwrap(),
        Value::string("laptop")
    );
    assert_eq!(
        evaluate("order.customer.tier == 'premium' ? 0.9 : 1.0", &mut ctx).unwrap(),
        Value::Float(0.9)
    );
}

#[test]
fn test_group_and_sort_pipeline() {
    let mut ctx = ctx_with(&[(
        "people",
        value!([
            {"name": "ann", "dept": "eng"},
            {"name": "bo", "dept": "ops"},
            {"name": "cy", "dept": "eng"}
        ]),
    )]);

    assert_eq!(
        evaluate("people.groupBy(p, p.dept).keys()", &mut ctx).unwrap(),
        value!(["eng", "ops"])
    );
    assert_eq!(
        evaluate(
            "people.sort(p, p.name).map(p, p.name).join('/')",
            &mut ctx
        )
        .unwrap(),
        Value::string("ann/bo/cy")
    );
}

#[test]
fn test_sql_ish_operators_together() {
    let mut ctx = ctx_with(&[("code", value!("SKU-1234")), ("qty", value!(7))]);
    assert_eq!(
        evaluate(
            "code like 'SKU-%' and qty between 1 and 10 and qty not in [2, 4]",
            &mut ctx
        )
        .unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn test_null_semantics() {
    let mut ctx = ctx_with(&[("maybe", Value::Null)]);
    assert_eq!(
        evaluate("maybe == null", &mut ctx).unwrap(),
        Value::Bool(true)
    );
    // Relational comparisons against null are false, not errors
    assert_eq!(
        evaluate("maybe < 1 || maybe > 1", &mut ctx).unwrap(),
        Value::Bool(false)
    );
    assert_eq!(
        evaluate("maybe ? 'yes' : 'no'", &mut ctx).unwrap(),
        Value::string("no")
    );
}

#[test]
fn test_time_pipeline_deterministic() {
    let mut ctx = Context::new();
    let fixed = verdict::datetime::parse_timestamp("2024-06-01T12:00:00Z").unwrap();
    ctx.set_time_source(move || fixed);

    assert_eq!(
        evaluate(
            "formatTime(addDuration(now(), duration('36h')), '%Y-%m-%d %H:%M')",
            &mut ctx
        )
        .unwrap(),
        Value::string("2024-06-03 00:00")
    );
    assert_eq!(
        evaluate("now() - timestamp('2024-06-01') == duration('12h')", &mut ctx).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn test_json_round_trip_through_language() {
    let mut ctx = ctx_with(&[("payload", value!({"k": [1, 2]}))]);
    assert_eq!(
        evaluate("fromJson(toJson(payload)) == payload", &mut ctx).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn test_user_function_registration() {
    let mut ctx = Context::new();
    ctx.register_function("tax", |args| match args {
        [v] => match v.as_f64() {
            Some(n) => Ok(Value::Float(n * 0.25)),
            None => Err(EvalError::TypeError("tax() wants a number".to_string())),
        },
        other => Err(EvalError::ArityError {
            name: "tax".to_string(),
            expected: 1,
            actual: other.len(),
        }),
    });
    ctx.set("gross", 400i64);
    assert_eq!(
        evaluate("gross - tax(gross)", &mut ctx).unwrap(),
        Value::Float(300.0)
    );
}

#[test]
fn test_error_taxonomy_surfaces() {
    let mut ctx = Context::new();

    assert!(matches!(
        evaluate("'unterminated", &mut ctx),
        Err(verdict::Error::Lex(_))
    ));
    assert!(matches!(
        evaluate("1 + + 2 )", &mut ctx),
        Err(verdict::Error::Parse(_))
    ));
    assert!(matches!(
        evaluate("ghost", &mut ctx),
        Err(verdict::Error::Eval(EvalError::UndefinedVariable(_)))
    ));
    assert!(matches!(
        evaluate("ghostFn(1)", &mut ctx),
        Err(verdict::Error::Eval(EvalError::UndefinedFunction(_)))
    ));
    assert!(matches!(
        evaluate("1 / 0", &mut ctx),
        Err(verdict::Error::Eval(EvalError::DivisionByZero))
    ));
    assert!(matches!(
        evaluate("matches('x', '[')", &mut ctx),
        Err(verdict::Error::Eval(EvalError::PatternError(_)))
    ));
    assert!(matches!(
        evaluate("int('twelve')", &mut ctx),
        Err(verdict::Error::Eval(EvalError::ConversionError(_)))
    ));
    assert!(matches!(
        evaluate("upper('a', 'b')", &mut ctx),
        Err(verdict::Error::Eval(EvalError::ArityError { .. }))
    ));
    assert!(matches!(
        evaluate("true.upper()", &mut ctx),
        Err(verdict::Error::Eval(EvalError::MethodNotFound { .. }))
    ));
    assert!(matches!(
        evaluate("true + 1", &mut ctx),
        Err(verdict::Error::Eval(EvalError::TypeError(_)))
    ));
}
