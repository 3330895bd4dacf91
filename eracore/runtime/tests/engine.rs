//! End-to-end engine tests: compile a source bundle, run an entry point,
//! observe outputs.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use era_runtime::{compile, Output};

fn files(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn run_main(src: &str) -> Vec<Output> {
    let vm = &mut compile(&files(&[("MAIN.ERB", src)])).expect("compile");
    vm.run("TITLE").expect("run")
}

fn texts(outputs: &[Output]) -> Vec<String> {
    outputs.iter().map(|o| o.text.clone()).collect()
}

fn temp_save_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_nanos();
    let dir = std::env::temp_dir().join(format!("era_{}_{}", tag, nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn basic_call_and_return() {
    let out = run_main(
        "@TITLE\n\
         A = 10\n\
         CALL HELLO(A)\n\
         IF RESULT == 11\n\
         \tPRINTL ok\n\
         ELSE\n\
         \tPRINTL ng\n\
         ENDIF\n\
         BEGIN NEXT\n\
         @HELLO(X)\n\
         RETURN X + 1\n\
         @NEXT\n\
         PRINTL done\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["ok", "done"]);
    assert!(out.iter().all(|o| o.new_line));
}

#[test]
fn named_csv_index() {
    let bundle = files(&[
        ("MAIN.ERH", "#DIM FLAG, 32\n"),
        ("FLAG.CSV", "5,MODE\n8,CHARA_TOTAL\n"),
        (
            "MAIN.ERB",
            "@TITLE\nFLAG:MODE = 7\nPRINTVL FLAG:5\nPRINTVL FLAG:MODE\nQUIT\n",
        ),
    ]);
    let vm = &mut compile(&bundle).expect("compile");
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["7", "7"]);
}

#[test]
fn try_catch_around_missing_jump() {
    let out = run_main(
        "@TITLE\n\
         A = 0\n\
         TRYCGOTO MISSING_LABEL\n\
         A = 1\n\
         CATCH\n\
         A = 2\n\
         ENDCATCH\n\
         PRINTVL A\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["2"]);
}

#[test]
fn try_catch_successful_jump_skips_catch_block() {
    let out = run_main(
        "@TITLE\n\
         A = 0\n\
         TRYCGOTO REALLABEL\n\
         A = 9\n\
         CATCH\n\
         A = 2\n\
         ENDCATCH\n\
         $REALLABEL\n\
         PRINTVL A\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["0"]);
}

#[test]
fn input_with_queue_and_default() {
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\nINPUT 5\nPRINTVL RESULT\nTINPUT 10, 42, 1, \"timeout\"\nPRINTVL RESULT\nQUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    vm.enqueue_input(["12", ""]);
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["12", "42"]);
}

#[test]
fn input_timeout_echoes_message_and_default() {
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\nTINPUT 10, 42, 1, \"timeout\"\nPRINTVL RESULT\nQUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["timeout", "42", "42"]);
}

#[test]
fn form_expansion_with_width_and_align() {
    let out = run_main("@TITLE\nA = 5\nPRINTFORML {A+1, 4, \"LEFT\"}x\nQUIT\n");
    assert_eq!(texts(&out), vec!["6   x"]);
    assert!(out[0].new_line);
}

#[test]
fn save_load_round_trip_in_binary_mode() {
    let dir = temp_save_dir("bin");
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\n\
         A = 9\n\
         #DIM ARR, 3\n\
         ARR:1 = 22\n\
         SAVEVAR \"bin1\", \"m\"\n\
         A = 0\n\
         ARR:1 = 0\n\
         LOADVAR \"bin1\"\n\
         PRINTVL A\n\
         PRINTVL ARR:1\n\
         QUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    vm.set_dat_save_format("binary").expect("save format");
    vm.set_save_dir(dir.to_string_lossy().to_string());
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["9", "22"]);

    let data = fs::read(dir.join("var_bin1.dat")).expect("read dat");
    assert_eq!(&data[..8], &0x0A1A0A0D41524589u64.to_le_bytes());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn save_both_mode_writes_companion_json() {
    let dir = temp_save_dir("both");
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\nA = 3\nSAVEVAR \"slot\"\nQUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    vm.set_dat_save_format("both").expect("save format");
    vm.set_save_dir(dir.to_string_lossy().to_string());
    vm.run("TITLE").expect("run");
    assert!(dir.join("var_slot.dat").exists());
    let json = fs::read(dir.join("var_slot.json")).expect("companion json");
    let snap: era_runtime::save::VarDataSnapshot =
        serde_json::from_slice(&json).expect("snapshot parses");
    assert_eq!(snap.format, "erago.var.v1");
    assert_eq!(snap.globals["A"].i, 3);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn savecodec_converts_binary_to_json() {
    let dir = temp_save_dir("conv");
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\nA = 41\nSAVEVAR \"conv\"\nQUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    vm.set_dat_save_format("binary").expect("save format");
    vm.set_save_dir(dir.to_string_lossy().to_string());
    vm.run("TITLE").expect("run");

    let input = dir.join("var_conv.dat");
    let output = dir.join("var_conv_out.json");
    era_runtime::convert_dat_file("var", &input, &output, "json").expect("convert");
    let snap: era_runtime::save::VarDataSnapshot =
        serde_json::from_slice(&fs::read(&output).expect("read json")).expect("parse");
    assert_eq!(snap.globals["A"].i, 41);

    // And back: the rewritten binary must still carry the magic.
    let back = dir.join("var_conv_back.dat");
    era_runtime::convert_dat_file("var", &output, &back, "binary").expect("convert back");
    let data = fs::read(&back).expect("read back");
    assert!(era_runtime::is_era_binary_data(&data));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn goto_label_loops() {
    let out = run_main(
        "@TITLE\nA = 0\n$LOOP\nA = A + 1\nIF A < 3\n\tGOTO LOOP\nENDIF\nPRINTVL A\nQUIT\n",
    );
    assert_eq!(texts(&out), vec!["3"]);
}

#[test]
fn loops_and_assign_operators() {
    let out = run_main(
        "@TITLE\n\
         A = 0\n\
         FOR I, 1, 3\n\
         \tA += I\n\
         NEXT\n\
         REPEAT 2\n\
         \tA += 10\n\
         REND\n\
         WHILE A < 30\n\
         \tA++\n\
         WEND\n\
         DO\n\
         \tA -= 3\n\
         LOOP A > 25\n\
         PRINTVL A\n\
         QUIT\n",
    );
    // 0 + (1+2) + 20 -> 23, WHILE pushes to 30, DO drains to 24.
    assert_eq!(texts(&out), vec!["24"]);
}

#[test]
fn for_loop_bounds_and_terminal_value() {
    let out = run_main(
        "@TITLE\nFOR I, 1, 3\n\tPRINTVL I\nNEXT\nPRINTVL I\nQUIT\n",
    );
    assert_eq!(texts(&out), vec!["1", "2", "3"]);
}

#[test]
fn do_loop_runs_at_least_once() {
    let out = run_main("@TITLE\nA = 0\nDO\n\tA += 1\nLOOP 0\nPRINTVL A\nQUIT\n");
    assert_eq!(texts(&out), vec!["1"]);
}

#[test]
fn sif_executes_exactly_once_when_truthy() {
    let out = run_main(
        "@TITLE\nA = 1\nSIF A\nPRINTL yes\nSIF A - 1\nPRINTL no\nPRINTL end\nQUIT\n",
    );
    assert_eq!(texts(&out), vec!["yes", "end"]);
}

#[test]
fn select_case_ranges_and_comparisons() {
    let out = run_main(
        "@TITLE\n\
         A = 7\n\
         SELECTCASE A\n\
         CASE 1, 2\n\
         \tPRINTL low\n\
         CASE 5 TO 8\n\
         \tPRINTL mid\n\
         CASE IS > 100\n\
         \tPRINTL high\n\
         CASEELSE\n\
         \tPRINTL other\n\
         ENDSELECT\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["mid"]);
}

#[test]
fn event_handlers_dispatch_in_priority_order() {
    let out = run_main(
        "@TITLE\n\
         BEGIN SHOP\n\
         @EVENTSHOP\n\
         PRINTL second\n\
         @EVENTSHOP\n\
         #PRI\n\
         PRINTL first\n",
    );
    assert_eq!(texts(&out), vec!["first", "second"]);
}

#[test]
fn try_call_list_dispatches_first_existing() {
    let out = run_main(
        "@TITLE\n\
         TRYCALLLIST\n\
         FUNC MISSING\n\
         FUNC REAL\n\
         ENDFUNC\n\
         PRINTL after\n\
         QUIT\n\
         @REAL\n\
         PRINTL hit\n\
         RETURN 1\n",
    );
    assert_eq!(texts(&out), vec!["hit", "after"]);
}

#[test]
fn try_call_list_all_missing_falls_through() {
    let out = run_main(
        "@TITLE\n\
         TRYCALLLIST\n\
         FUNC NOPE\n\
         ENDFUNC\n\
         PRINTL after\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["after"]);
}

#[test]
fn ref_binding_redirects_reads_and_writes() {
    let bundle = files(&[
        ("MAIN.ERH", "#DIM REF R\n#DIM FLAG, 16\n"),
        (
            "MAIN.ERB",
            "@TITLE\nFLAG:3 = 9\nR = FLAG:3\nPRINTVL R\nR = 5\nPRINTVL FLAG:3\nQUIT\n",
        ),
    ]);
    let vm = &mut compile(&bundle).expect("compile");
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["9", "5"]);
}

#[test]
fn input_queue_order_is_preserved() {
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\nINPUT\nPRINTVL RESULT\nINPUT\nPRINTVL RESULT\nINPUT\nPRINTVL RESULT\nQUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    vm.enqueue_input(["3", "1", "2"]);
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["3", "1", "2"]);
}

#[test]
fn print_wait_consumes_one_queued_entry() {
    let bundle = files(&[(
        "MAIN.ERB",
        "@TITLE\nPRINTW pause\nINPUT\nPRINTVL RESULT\nQUIT\n",
    )]);
    let vm = &mut compile(&bundle).expect("compile");
    vm.enqueue_input(["swallowed", "7"]);
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["pause", "7"]);
}

#[test]
fn ternary_and_string_operators() {
    let out = run_main(
        "@TITLE\n\
         A = 3\n\
         S = A > 2 ? \"big\" # \"small\"\n\
         PRINTVL S\n\
         PRINTVL \"ab\" * 2\n\
         PRINTVL 7 / 0\n\
         PRINTVL 7 % 0\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["big", "abab", "7", "0"]);
}

#[test]
fn inline_method_calls_in_expressions() {
    let out = run_main(
        "@TITLE\n\
         PRINTVL MAX(3, 9, 4)\n\
         PRINTVL SUBSTRING(\"hello\", 1, 3)\n\
         PRINTVL TOUPPER(\"ab\")\n\
         PRINTVL LIMIT(15, 0, 10)\n\
         QUIT\n",
    );
    assert_eq!(texts(&out), vec!["9", "ell", "AB", "10"]);
}

#[test]
fn inline_function_call_substitutes_result() {
    let out = run_main(
        "@TITLE\nA = DOUBLE(21)\nPRINTVL A\nQUIT\n@DOUBLE(X)\nRETURN X * 2\n",
    );
    assert_eq!(texts(&out), vec!["42"]);
}

#[test]
fn seeded_rand_is_in_range() {
    let out = run_main("@TITLE\nINITRAND 123\nPRINTVL RAND(1)\nPRINTVL RAND:1\nQUIT\n");
    assert_eq!(texts(&out), vec!["0", "0"]);
}

#[test]
fn strdata_picks_single_entry() {
    let out = run_main(
        "@TITLE\nSTRDATA S\nDATA only\nENDDATA\nPRINTVL S\nQUIT\n",
    );
    assert_eq!(texts(&out), vec!["only"]);
}

#[test]
fn template_without_placeholders_is_fixed_point() {
    let out = run_main("@TITLE\nPRINTFORML plain text 1+1\nQUIT\n");
    assert_eq!(texts(&out), vec!["plain text 1+1"]);
}

#[test]
fn throw_surfaces_message_with_context() {
    let bundle = files(&[("MAIN.ERB", "@TITLE\nTHROW bad state\nQUIT\n")]);
    let vm = &mut compile(&bundle).expect("compile");
    let err = vm.run("TITLE").expect_err("must fail");
    assert!(err.to_string().contains("THROW"), "{}", err);
    assert!(err.to_string().contains("TITLE"), "{}", err);
}

#[test]
fn uncaught_goto_is_an_error() {
    let bundle = files(&[("MAIN.ERB", "@TITLE\nGOTO NOWHERE\nQUIT\n")]);
    let vm = &mut compile(&bundle).expect("compile");
    let err = vm.run("TITLE").expect_err("must fail");
    assert!(err.to_string().contains("NOWHERE"), "{}", err);
}

#[test]
fn character_roster_commands() {
    let bundle = files(&[
        ("CHARA001.CSV", "番号,1\n名前,Alice\n"),
        (
            "MAIN.ERB",
            "@TITLE\n\
             ADDCHARA 1\n\
             ADDCHARA 4\n\
             PRINTVL CHARANUM\n\
             FINDCHARA 4\n\
             PRINTVL RESULT\n\
             PRINTVL NAME:0\n\
             DELCHARA 0\n\
             PRINTVL CHARANUM\n\
             QUIT\n",
        ),
    ]);
    let vm = &mut compile(&bundle).expect("compile");
    let out = vm.run("TITLE").expect("run");
    assert_eq!(texts(&out), vec!["2", "1", "Alice", "1"]);
}

#[test]
fn gamebase_identity_gates_binary_load() {
    let dir = temp_save_dir("gate");
    // Same save dir, two programs with different GAMEBASE codes.
    let writer = files(&[
        ("GAMEBASE.CSV", "CODE,100\nVERSION,1\n"),
        ("MAIN.ERB", "@TITLE\nA = 1\nSAVEVAR \"x\"\nQUIT\n"),
    ]);
    let vm = &mut compile(&writer).expect("compile");
    vm.set_dat_save_format("binary").expect("fmt");
    vm.set_save_dir(dir.to_string_lossy().to_string());
    vm.run("TITLE").expect("run");

    let reader = files(&[
        ("GAMEBASE.CSV", "CODE,200\nVERSION,1\n"),
        ("MAIN.ERB", "@TITLE\nLOADVAR \"x\"\nQUIT\n"),
    ]);
    let vm2 = &mut compile(&reader).expect("compile");
    vm2.set_dat_save_format("binary").expect("fmt");
    vm2.set_save_dir(dir.to_string_lossy().to_string());
    let err = vm2.run("TITLE").expect_err("identity mismatch must fail");
    assert!(err.to_string().contains("incompatible"), "{}", err);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn compile_is_repeatable() {
    let bundle = files(&[("MAIN.ERB", "@TITLE\nPRINTL hi\nQUIT\n")]);
    let a = era_runtime::parse(&bundle).expect("parse");
    let b = era_runtime::parse(&bundle).expect("parse");
    assert_eq!(a.order, b.order);
    assert_eq!(a.functions.len(), b.functions.len());
    let out1 = compile(&bundle).unwrap().run("TITLE").unwrap();
    let out2 = compile(&bundle).unwrap().run("TITLE").unwrap();
    assert_eq!(out1, out2);
}
