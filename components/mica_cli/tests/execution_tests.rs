//! End-to-end scenarios: source in, console output out.

use core_types::Time;
use interpreter::FixedResolver;
use mica_cli::{run_capturing, run_capturing_with};
use std::rc::Rc;

#[test]
fn test_loop_accumulation() {
    let out = run_capturing("var a = 0; for (var i = 1; i <= 10; i = i + 1) a = a + i; println(a);")
        .unwrap();
    assert_eq!(out, "55\n");
}

#[test]
fn test_recursive_factorial() {
    let out =
        run_capturing("function f(x){ if (x<=1) return 1; return x*f(x-1);} println(f(5));")
            .unwrap();
    assert_eq!(out, "120\n");
}

#[test]
fn test_for_in_over_array() {
    let out =
        run_capturing("var a = [3,1,4,1,5,9]; var s=0; for (var v : a) s = s+v; println(s);")
            .unwrap();
    assert_eq!(out, "23\n");
}

#[test]
fn test_switch_fall_through() {
    let out = run_capturing(
        r#"switch (2) { case 1: println("a"); case 2: println("b"); case 3: println("c"); break; default: println("d"); }"#,
    )
    .unwrap();
    assert_eq!(out, "b\nc\n");
}

#[test]
fn test_switch_default_when_nothing_matches() {
    let out = run_capturing(
        r#"switch (9) { case 1: println("a"); case 2: println("b"); default: println("d"); }"#,
    )
    .unwrap();
    assert_eq!(out, "d\n");
}

#[test]
fn test_class_constructor_and_method() {
    let out = run_capturing(
        "class P { constructor(x){ this.x = x; } get(){ return this.x; } } var p = new P(7); println(p.get());",
    )
    .unwrap();
    assert_eq!(out, "7\n");
}

#[test]
fn test_hostname_lookup_delivers_event_once() {
    let out = run_capturing_with(
        r#"IPAddr.lookupHostname("example.test", function(name, ip){ println(ip.toString()); }); waitForEvent();"#,
        Some(Rc::new(FixedResolver([10, 0, 0, 1]))),
    )
    .unwrap();
    assert_eq!(out, "10.0.0.1\n");
}

#[test]
fn test_delay_suspends_for_at_least_the_requested_time() {
    let start = Time::now();
    let out = run_capturing(r#"delay(30); println("done");"#).unwrap();
    let elapsed = Time::now() - start;
    assert_eq!(out, "done\n");
    assert!(elapsed.as_millis() >= 30, "only {}ms elapsed", elapsed.as_millis());
}

#[test]
fn test_iterator_contract_with_custom_object() {
    // Any object with iterator/done/next participates in for..in.
    let out = run_capturing(
        r#"
        function makeIterable(limit) {
            var o = {};
            o.limit = limit;
            o.iterator = function() {
                var it = {};
                it.limit = this.limit;
                it.pos = 0;
                it.done = function() { return this.pos >= this.limit; };
                it.next = function() { var v = this.pos; this.pos = this.pos + 1; return v; };
                return it;
            };
            return o;
        }
        var total = 0;
        for (var v : makeIterable(4)) total = total + v;
        println(total);
        "#,
    )
    .unwrap();
    assert_eq!(out, "6\n");
}

#[test]
fn test_while_break_continue() {
    let out = run_capturing(
        r#"
        var n = 0;
        var sum = 0;
        while (true) {
            n = n + 1;
            if (n > 10) break;
            if (n % 2 == 0) continue;
            sum = sum + n;
        }
        println(sum);
        "#,
    )
    .unwrap();
    assert_eq!(out, "25\n");
}

#[test]
fn test_do_while() {
    let out = run_capturing("var i = 0; do { i = i + 1; } while (i < 5); println(i);").unwrap();
    assert_eq!(out, "5\n");
}

#[test]
fn test_compound_assignment_and_shifts() {
    let out = run_capturing(
        "var a = 1; a += 4; a *= 3; a -= 5; println(a); var b = 1; b <<= 4; println(b >> 2); println(-1 >>> 28);",
    )
    .unwrap();
    assert_eq!(out, "10\n4\n15\n");
}

#[test]
fn test_ternary_and_logical_short_circuit() {
    let out = run_capturing(
        r#"
        function boom() { println("side effect"); return true; }
        var x = false && boom();
        var y = true || boom();
        println(x ? "t" : "f");
        println(y ? "t" : "f");
        "#,
    )
    .unwrap();
    assert_eq!(out, "f\nt\n");
}

#[test]
fn test_object_literal_and_element_access() {
    let out = run_capturing(
        r#"var o = { a: 1, b: "two" }; println(o.a); println(o.b); var arr = [10, 20]; arr[1] = 21; println(arr[0] + arr[1]);"#,
    )
    .unwrap();
    assert_eq!(out, "1\ntwo\n31\n");
}

#[test]
fn test_printf_formatting() {
    let out = run_capturing(r#"printf("%d-%s-%x\n", 42, "mid", 255);"#).unwrap();
    assert_eq!(out, "42-mid-ff\n");
}

#[test]
fn test_string_conversions() {
    let out = run_capturing(r#"println(toInt("42") + 1); println(toFloat(" 2.5 "));"#).unwrap();
    assert_eq!(out, "43\n2.5\n");
}

#[test]
fn test_arguments_array() {
    let out = run_capturing(
        r#"
        function sum() {
            var total = 0;
            for (var v : arguments()) total = total + v;
            return total;
        }
        println(sum(1, 2, 3, 4));
        "#,
    )
    .unwrap();
    assert_eq!(out, "10\n");
}

#[test]
fn test_base64_round_trip() {
    let out = run_capturing(
        r#"var e = Base64.encode("hello"); println(e); println(Base64.decode(e));"#,
    )
    .unwrap();
    assert_eq!(out, "aGVsbG8=\nhello\n");
}

#[test]
fn test_json_round_trip() {
    let out = run_capturing(
        r#"
        var o = JSON.parse("{\"a\": 1, \"b\": [true, null]}");
        println(o.a);
        println(JSON.stringify(o));
        "#,
    )
    .unwrap();
    assert_eq!(out, "1\n{\"a\":1,\"b\":[true,null]}\n");
}

#[test]
fn test_meminfo_fields() {
    let out = run_capturing(
        r#"
        var m = meminfo();
        println(m.numAllocations > 0);
        println(m.allocatedSize > 0);
        "#,
    )
    .unwrap();
    assert_eq!(out, "true\ntrue\n");
}

#[test]
fn test_gpio_simulation() {
    let out = run_capturing(
        r#"
        GPIO.setPinMode(4, GPIO.PinMode.Output);
        GPIO.digitalWrite(4, true);
        println(GPIO.digitalRead(4));
        println(GPIO.digitalRead(5));
        "#,
    )
    .unwrap();
    assert_eq!(out, "true\nfalse\n");
}

#[test]
fn test_class_var_literal_initializers() {
    let out = run_capturing(
        r#"
        class C { var tag = "t"; var n = 3; var f; }
        var c = new C();
        println(c.tag);
        println(c.n);
        "#,
    )
    .unwrap();
    assert_eq!(out, "t\n3\n");
}

#[test]
fn test_nested_functions_and_globals() {
    let out = run_capturing(
        r#"
        function outer(x) {
            function inner(y) { return y * 2; }
            return inner(x) + 1;
        }
        println(outer(10));
        "#,
    )
    .unwrap();
    assert_eq!(out, "21\n");
}

#[test]
fn test_parse_error_reports_line() {
    let err = run_capturing("var a = 1;\nvar ;").unwrap_err();
    let text = format!("{}", err);
    assert!(text.contains("line 2"), "got: {}", text);
}

#[test]
fn test_runtime_error_does_not_panic() {
    // Calling a missing property is a task-fatal error with a trace, not
    // a crash; prior output survives.
    let out = run_capturing(r#"println("before"); var o = {}; o.nope();"#).unwrap();
    assert!(out.starts_with("before\n"));
    assert!(out.contains("error"), "got: {}", out);
}
