#[test]
fn derive_fixtures() {
    let t = trybuild::TestCases::new();
    t.pass("tests/fixtures/derive_pass.rs");
    t.compile_fail("tests/fixtures/derive_fail.rs");
}
