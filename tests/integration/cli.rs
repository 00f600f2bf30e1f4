// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use assert_cmd::Command;
use simple_test_case::test_case;

#[test_case("expd-storage"; "storage daemon")]
#[test_case("expd-minion"; "minion daemon")]
#[test]
fn missing_arguments_exit_two(bin: &str) {
    Command::cargo_bin(bin).unwrap().assert().failure().code(2);
}

#[test_case("expd-storage"; "storage daemon")]
#[test_case("expd-minion"; "minion daemon")]
#[test]
fn missing_config_file_exits_three(bin: &str) {
    Command::cargo_bin(bin)
        .unwrap()
        .args(["-c", "no/such/config.json"])
        .assert()
        .failure()
        .code(3);
}

#[test_case("expd-storage"; "storage daemon")]
#[test_case("expd-minion"; "minion daemon")]
#[test]
fn long_form_cfg_flag_is_accepted(bin: &str) {
    Command::cargo_bin(bin)
        .unwrap()
        .args(["--cfg", "no/such/config.json"])
        .assert()
        .failure()
        .code(3);
}
