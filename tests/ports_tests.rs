use sniffscan_rs::ports::parse_ports_str;

#[test]
fn parse_mixed_spec_sorted_and_deduped() {
    let input = r#"
        # common ports
        443, 22
        80  # http
        8000-8002, 8001  # duplicate inside range
        # blank line follows

    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_ports_str("0").is_err());
    assert!(parse_ports_str("22,65536").is_err());
}
