use rstest::rstest;

use crate::asm::Assembler;
use crate::link::{link, LinkInput, LinkOptions};
use crate::object::{Info, ObjectData, ObjectHeader, RelocRecord};
use crate::relocate::{relocate, RelocateOptions};
use crate::source::SourceStream;
use crate::HEADER_SIZE;

fn assemble_str(src: &str) -> Vec<u8> {
    try_assemble(src).unwrap()
}

fn try_assemble(src: &str) -> anyhow::Result<Vec<u8>> {
    let stream = SourceStream::from_literal("test.s", src);
    Assembler::new(stream, false, false).assemble()
}

fn parse(image: &[u8]) -> ObjectData {
    ObjectData::parse(image.to_vec()).unwrap()
}

fn text_bytes(image: &[u8]) -> &[u8] {
    let header = ObjectHeader::parse(image).unwrap();
    &image[usize::from(HEADER_SIZE)..usize::from(header.text_top)]
}

#[test]
fn basic_emit() {
    let image = assemble_str(".text\nmain: nop\n halt\n");
    let obj = parse(&image);
    assert_eq!(text_bytes(&image), &[0x00, 0x76][..]);
    assert_eq!(obj.header.text_top, 18);
    assert_eq!(obj.header.data_top, 18);
    assert_eq!(obj.header.bss_top, 18);
    assert!(obj.relocs().unwrap().is_empty());
    assert!(obj.symbols().unwrap().is_empty());
}

#[test]
fn forward_reference() {
    let image = assemble_str(".text\n jp later\nlater: nop\n");
    let obj = parse(&image);
    assert_eq!(text_bytes(&image), &[0xC3, 0x13, 0x00, 0x00][..]);
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 1, addr: 17 }]
    );
}

#[test]
fn segment_mix() {
    let image =
        assemble_str(".data\nmsg: .def byte \"hi\"\n.text\n ld hl, msg\n");
    let obj = parse(&image);
    // text holds the load, data follows with the string
    assert_eq!(text_bytes(&image), &[0x21, 0x13, 0x00][..]);
    assert_eq!(obj.header.text_top, 19);
    assert_eq!(obj.header.data_top, 21);
    assert_eq!(&obj.segment_bytes()[3..], &b"hi"[..]);
    // one fix-up for the load operand, none for the data bytes
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 2, addr: 17 }]
    );
}

#[test]
fn external_reference() {
    let image = assemble_str(".extern printf\n call printf\n");
    let obj = parse(&image);
    assert_eq!(text_bytes(&image), &[0xCD, 0x00, 0x00][..]);
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 5, addr: 17 }]
    );
    let syms = obj.symbols().unwrap();
    assert_eq!(syms.len(), 1);
    assert_eq!(syms[0].name, "printf");
    assert_eq!(syms[0].tag, 5);
}

#[test]
fn globl_exports_symbol() {
    let image = assemble_str(".text\nmain: nop\n.globl main\n");
    let syms = parse(&image).symbols().unwrap();
    assert_eq!(syms.len(), 1);
    assert_eq!(syms[0].name, "main");
    assert_eq!(syms[0].tag, 1);
    assert_eq!(syms[0].value, 16);
}

#[test]
fn linker_merge() {
    // two objects of 0x20 text bytes each; the second imports main
    let exporter = assemble_str("main: nop\n .def byte[31] 0\n.globl main\n");
    let importer = assemble_str(".extern main\n call main\n .def byte[29] 0\n");

    let out = link(
        vec![
            LinkInput {
                name: "a.o".into(),
                bytes: exporter,
            },
            LinkInput {
                name: "b.o".into(),
                bytes: importer,
            },
        ],
        LinkOptions::default(),
    )
    .unwrap();

    let obj = parse(&out);
    assert_eq!(obj.header.text_top, 0x50);
    // the importer's call got the exporter's text base patched in
    assert_eq!(&out[0x30..0x33], &[0xCD, 0x10, 0x00][..]);
    // the patch is recorded against the text segment at its new address
    assert!(obj
        .relocs()
        .unwrap()
        .contains(&RelocRecord { tag: 1, addr: 0x31 }));
    let syms = obj.symbols().unwrap();
    assert_eq!(syms.len(), 1);
    assert_eq!(syms[0].name, "main");
    assert_eq!(syms[0].value, 16);
}

#[test]
fn local_labels() {
    let image = assemble_str(".text\n1: jr 1b\n2: jr 2f\n2: nop\n");
    assert_eq!(text_bytes(&image), &[0x18, 0xFE, 0x18, 0x00, 0x00][..]);
}

#[test]
fn conditional_blocks() {
    let image =
        assemble_str(".if 0\n nop\n nop\n.endif\n.if 1\n halt\n.endif\n");
    assert_eq!(text_bytes(&image), &[0x76][..]);
}

#[test]
fn types_and_fields() {
    let image = assemble_str(concat!(
        ".type point { word x, word y }\n",
        ".data\n",
        ".defl point origin { 1, 2 }\n",
        ".text\n",
        " ld hl, origin.y\n",
        " ld a, $point\n",
    ));
    let obj = parse(&image);
    // text is 5 bytes, so the data base (and origin) sits at 21
    assert_eq!(
        text_bytes(&image),
        &[0x21, 0x17, 0x00, 0x3E, 0x04][..]
    );
    assert_eq!(&obj.segment_bytes()[5..], &[1, 0, 2, 0][..]);
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 2, addr: 17 }]
    );
}

#[test]
fn equates_shift_with_their_segment() {
    let image = assemble_str(concat!(
        ".data\nbuf: .def word 0\nalias = buf\n",
        ".text\n ld hl, alias\n.globl alias\n"
    ));
    let obj = parse(&image);
    let syms = obj.symbols().unwrap();
    assert_eq!(syms[0].name, "alias");
    assert_eq!(syms[0].tag, 2);
    // data base = 16 + 3 text bytes
    assert_eq!(syms[0].value, 19);
}

#[test]
fn bss_takes_no_bytes() {
    let image = assemble_str(concat!(
        ".bss\nbuf: .def byte[64] 0\n",
        ".text\n ld hl, buf\n"
    ));
    let obj = parse(&image);
    assert_eq!(obj.header.text_top, 19);
    assert_eq!(obj.header.data_top, 19);
    assert_eq!(obj.header.bss_top, 19 + 64);
    // file ends after text; bss contributed nothing
    assert_eq!(obj.segment_bytes().len(), 3);
    assert_eq!(text_bytes(&image), &[0x21, 0x13, 0x00][..]);
}

#[test]
fn nonzero_bss_write_fails() {
    assert!(try_assemble(".bss\n.def byte 5\n").is_err());
}

#[test]
fn undefined_symbol_fails_second_pass() {
    assert!(try_assemble(" jp nowhere\n").is_err());
}

#[test]
fn zero_divide_fails_second_pass() {
    assert!(try_assemble("x = 1/0\n").is_err());
}

#[test]
fn relative_branch_out_of_range() {
    assert!(
        try_assemble(" jr far\n .def byte[200] 0\nfar: nop\n").is_err()
    );
}

#[test]
fn duplicate_label_fails() {
    assert!(try_assemble("a: nop\na: nop\n").is_err());
}

#[test]
fn relocator_is_idempotent_at_current_origin() {
    let image =
        assemble_str(".data\nmsg: .def byte \"hi\"\n.text\n ld hl, msg\n");
    let moved = relocate(&image, 0, RelocateOptions::default()).unwrap();
    assert_eq!(moved, image);
}

#[test]
fn relocator_shifts_fixups_and_symbols() {
    let image = assemble_str(".text\n jp later\nlater: nop\n.globl later\n");
    let moved = relocate(&image, 0x100, RelocateOptions::default()).unwrap();
    let obj = parse(&moved);
    assert_eq!(obj.header.org, 0x100);
    assert_eq!(&moved[16..20], &[0xC3, 0x13, 0x01, 0x00][..]);
    let syms = obj.symbols().unwrap();
    assert_eq!(syms[0].value, 0x0113);
    // the records themselves still name the file offsets
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 1, addr: 17 }]
    );
}

#[test]
fn relocator_freezes_to_data() {
    let image = assemble_str(".text\n jp later\nlater: nop\n.globl later\n");
    let opts = RelocateOptions {
        to_data: true,
        ..Default::default()
    };
    let moved = relocate(&image, 0x200, opts).unwrap();
    let obj = parse(&moved);
    assert_eq!(obj.header.text_top, 0);
    assert_eq!(&moved[16..20], &[0xC3, 0x13, 0x02, 0x00][..]);
    assert!(obj.relocs().unwrap().is_empty());
    let syms = obj.symbols().unwrap();
    assert_eq!(syms[0].tag, 4);
    assert_eq!(syms[0].value, 0x0213);
}

#[test]
fn relocator_splits_off_the_bss() {
    let image = assemble_str(concat!(
        ".bss\nbuf: .def byte[16] 0\n",
        ".text\n ld hl, buf\n ld de, 0f\n0: nop\n.globl buf\n"
    ));
    let opts = RelocateOptions {
        bss_base: Some(0x8000),
        ..Default::default()
    };
    let moved = relocate(&image, 0, opts).unwrap();
    let obj = parse(&moved);
    // bss no longer follows this image
    assert_eq!(obj.header.bss_top, obj.header.data_top);
    // the bss word went absolute, the text word kept its record
    assert_eq!(&moved[16..19], &[0x21, 0x00, 0x80][..]);
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 1, addr: 20 }]
    );
    let syms = obj.symbols().unwrap();
    assert_eq!(syms[0].tag, 4);
    assert_eq!(syms[0].value, 0x8000);
}

#[test]
fn linker_demand_loads_archive_members() {
    let helper = assemble_str("helper: ret\n.globl helper\n");
    let unused = assemble_str("spare: nop\n.globl spare\n");
    let caller = assemble_str(".extern helper\n call helper\n");

    let mut archive = crate::archive::AR_MAGIC.to_vec();
    for (name, body) in [("unused.o", &unused), ("helper.o", &helper)] {
        archive.extend_from_slice(format!("{:<16}", name).as_bytes());
        archive.extend_from_slice(b"0           ");
        archive.extend_from_slice(b"0     0     ");
        archive.extend_from_slice(b"100644  ");
        archive.extend_from_slice(format!("{:<10}", body.len()).as_bytes());
        archive.extend_from_slice(b"`\n");
        archive.extend_from_slice(body);
        if body.len() & 1 == 1 {
            archive.push(b'\n');
        }
    }

    let out = link(
        vec![
            LinkInput {
                name: "caller.o".into(),
                bytes: caller,
            },
            LinkInput {
                name: "lib.a".into(),
                bytes: archive,
            },
        ],
        LinkOptions::default(),
    )
    .unwrap();

    let obj = parse(&out);
    let syms = obj.symbols().unwrap();
    // only the wanted member was loaded
    assert!(syms.iter().any(|s| s.name == "helper"));
    assert!(!syms.iter().any(|s| s.name == "spare"));
    // caller text is first; the call targets the helper's base
    let helper_base = 16 + 3;
    assert_eq!(&out[16..19], &[0xCD, helper_base as u8, 0x00][..]);
}

#[test]
fn relocatable_link_keeps_externals() {
    let importer = assemble_str(".extern putc\n call putc\n");
    let out = link(
        vec![LinkInput {
            name: "a.o".into(),
            bytes: importer,
        }],
        LinkOptions {
            relocatable: true,
            ..Default::default()
        },
    )
    .unwrap();
    let obj = parse(&out);
    assert!(!obj.header.info.contains(Info::LINKED));
    assert_eq!(&out[16..19], &[0xCD, 0x00, 0x00][..]);
    assert_eq!(
        obj.relocs().unwrap(),
        vec![RelocRecord { tag: 5, addr: 17 }]
    );
    let syms = obj.symbols().unwrap();
    assert_eq!(syms[0].name, "putc");
    assert_eq!(syms[0].tag, 5);
}

#[test]
fn unresolved_external_fails_without_relocatable() {
    let importer = assemble_str(".extern putc\n call putc\n");
    let err = link(
        vec![LinkInput {
            name: "a.o".into(),
            bytes: importer,
        }],
        LinkOptions::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("putc"));
}

#[test]
fn duplicate_definition_fails_at_link() {
    let a = assemble_str("main: nop\n.globl main\n");
    let b = assemble_str("main: halt\n.globl main\n");
    assert!(link(
        vec![
            LinkInput {
                name: "a.o".into(),
                bytes: a
            },
            LinkInput {
                name: "b.o".into(),
                bytes: b
            },
        ],
        LinkOptions::default(),
    )
    .is_err());
}

#[rstest]
#[case(" nop", &[0x00])]
#[case(" halt", &[0x76])]
#[case(" exx", &[0xD9])]
#[case(" neg", &[0xED, 0x44])]
#[case(" ldir", &[0xED, 0xB0])]
#[case(" ld a, b", &[0x78])]
#[case(" ld b, (hl)", &[0x46])]
#[case(" ld (hl), e", &[0x73])]
#[case(" ld a, 0x12", &[0x3E, 0x12])]
#[case(" ld (hl), 0xFF", &[0x36, 0xFF])]
#[case(" ld h, (ix+5)", &[0xDD, 0x66, 0x05])]
#[case(" ld (iy-1), b", &[0xFD, 0x70, 0xFF])]
#[case(" ld (ix+2), 7", &[0xDD, 0x36, 0x02, 0x07])]
#[case(" ld ixh, a", &[0xDD, 0x67])]
#[case(" ld ixl, ixh", &[0xDD, 0x6C])]
#[case(" ld iyl, 3", &[0xFD, 0x2E, 0x03])]
#[case(" ld bc, 0x1234", &[0x01, 0x34, 0x12])]
#[case(" ld ix, 0x8000", &[0xDD, 0x21, 0x00, 0x80])]
#[case(" ld hl, (0x4000)", &[0x2A, 0x00, 0x40])]
#[case(" ld sp, (0x4000)", &[0xED, 0x7B, 0x00, 0x40])]
#[case(" ld (0x4000), hl", &[0x22, 0x00, 0x40])]
#[case(" ld (0x4000), bc", &[0xED, 0x43, 0x00, 0x40])]
#[case(" ld (0x4000), iy", &[0xFD, 0x22, 0x00, 0x40])]
#[case(" ld (0x4000), a", &[0x32, 0x00, 0x40])]
#[case(" ld a, (0x4000)", &[0x3A, 0x00, 0x40])]
#[case(" ld a, (bc)", &[0x0A])]
#[case(" ld (de), a", &[0x12])]
#[case(" ld sp, hl", &[0xF9])]
#[case(" ld sp, ix", &[0xDD, 0xF9])]
#[case(" ld a, i", &[0xED, 0x57])]
#[case(" ld r, a", &[0xED, 0x4F])]
#[case(" add a, b", &[0x80])]
#[case(" add (hl)", &[0x86])]
#[case(" add a, 1", &[0xC6, 0x01])]
#[case(" adc a, (ix+3)", &[0xDD, 0x8E, 0x03])]
#[case(" sub 5", &[0xD6, 0x05])]
#[case(" xor a", &[0xAF])]
#[case(" cp 'q'", &[0xFE, 0x71])]
#[case(" add hl, sp", &[0x39])]
#[case(" adc hl, bc", &[0xED, 0x4A])]
#[case(" sbc hl, de", &[0xED, 0x52])]
#[case(" add ix, bc", &[0xDD, 0x09])]
#[case(" add iy, iy", &[0xFD, 0x29])]
#[case(" inc a", &[0x3C])]
#[case(" dec (hl)", &[0x35])]
#[case(" inc de", &[0x13])]
#[case(" dec sp", &[0x3B])]
#[case(" inc ix", &[0xDD, 0x23])]
#[case(" inc ixh", &[0xDD, 0x24])]
#[case(" inc (ix+1)", &[0xDD, 0x34, 0x01])]
#[case(" rlc b", &[0xCB, 0x00])]
#[case(" srl (hl)", &[0xCB, 0x3E])]
#[case(" sll a", &[0xCB, 0x37])]
#[case(" bit 7, a", &[0xCB, 0x7F])]
#[case(" set 3, (hl)", &[0xCB, 0xDE])]
#[case(" res 0, (ix+4)", &[0xDD, 0xCB, 0x04, 0x86])]
#[case(" set 0, (ix+2), b", &[0xDD, 0xCB, 0x02, 0xC0])]
#[case(" rlc (iy+1), c", &[0xFD, 0xCB, 0x01, 0x01])]
#[case(" push bc", &[0xC5])]
#[case(" push af", &[0xF5])]
#[case(" pop iy", &[0xFD, 0xE1])]
#[case(" ret", &[0xC9])]
#[case(" ret z", &[0xC8])]
#[case(" ret cr", &[0xD8])]
#[case(" jp 0x1234", &[0xC3, 0x34, 0x12])]
#[case(" jp nz, 0x1234", &[0xC2, 0x34, 0x12])]
#[case(" jp m, 0", &[0xFA, 0x00, 0x00])]
#[case(" jp (hl)", &[0xE9])]
#[case(" jp (ix)", &[0xDD, 0xE9])]
#[case(" call 0x1234", &[0xCD, 0x34, 0x12])]
#[case(" call c, 0x1234", &[0xDC, 0x34, 0x12])]
#[case(" call po, 8", &[0xE4, 0x08, 0x00])]
#[case(" rst 0x28", &[0xEF])]
#[case(" rst 0", &[0xC7])]
#[case(" in a, (0xFE)", &[0xDB, 0xFE])]
#[case(" in d, (c)", &[0xED, 0x50])]
#[case(" out (0xFE), a", &[0xD3, 0xFE])]
#[case(" out (c), e", &[0xED, 0x59])]
#[case(" ex af, af'", &[0x08])]
#[case(" ex de, hl", &[0xEB])]
#[case(" ex (sp), hl", &[0xE3])]
#[case(" ex (sp), ix", &[0xDD, 0xE3])]
#[case(" im 0", &[0xED, 0x46])]
#[case(" im 1", &[0xED, 0x56])]
#[case(" im 2", &[0xED, 0x5E])]
#[case(" djnz 0f\n0: nop", &[0x10, 0x00, 0x00])]
#[case(" jr nc, 0f\n0: nop", &[0x30, 0x00, 0x00])]
fn encodes(#[case] line: &str, #[case] expected: &[u8]) {
    let image = assemble_str(&format!(".text\n{}\n", line));
    assert_eq!(text_bytes(&image), expected, "for `{}`", line.trim());
}

#[rstest]
#[case(" ld (hl), (hl)")]
#[case(" ld ixh, h")]
#[case(" ld ixh, iyl")]
#[case(" ld ixh, (ix+1)")]
#[case(" ld bc, de")]
#[case(" add hl, ix")]
#[case(" rst 3")]
#[case(" bit 8, a")]
#[case(" im 5")]
#[case(" jr pe, 0")]
#[case(" mov a, b")]
fn rejects(#[case] line: &str) {
    assert!(
        try_assemble(&format!(".text\n{}\n", line)).is_err(),
        "expected `{}` to fail",
        line.trim()
    );
}

#[rstest]
#[case("v = 10\n", 10)]
#[case("v = 0x1F\n", 0x1F)]
#[case("v = 1Fh\n", 0x1F)]
#[case("v = 0b101\n", 5)]
#[case("v = 17o\n", 15)]
#[case("v = 017\n", 15)]
#[case("v = 2 + 3 * 4\n", 14)]
#[case("v = (2 + 3) * 4\n", 20)]
#[case("v = 1 << 2 + 3\n", 7)]
#[case("v = 100 / 7 % 5\n", 4)]
#[case("v = 'A'\n", 65)]
#[case("v = '\\n'\n", 10)]
#[case("v = 0xF0 ^ 0xFF\n", 0x0F)]
#[case("v = 0 ! 1\n", 0xFFFE)]
#[case("base = 0x10\nv = base + 2\n", 0x12)]
fn evaluates(#[case] src: &str, #[case] expected: u16) {
    let image = assemble_str(&format!("{}.data\n.def word v\n", src));
    let obj = parse(&image);
    let bytes = obj.segment_bytes();
    assert_eq!(
        u16::from_le_bytes([bytes[0], bytes[1]]),
        expected,
        "for {:?}",
        src
    );
}

#[test]
fn strings_support_numeric_escapes() {
    let image =
        assemble_str(".data\n.def byte \"a\\t\\x41\\101\\0z\"\n.text\n nop\n");
    let obj = parse(&image);
    assert_eq!(&obj.segment_bytes()[1..], &[b'a', 9, 0x41, 0o101, 0, b'z'][..]);
}

#[test]
fn size_of_symbols_is_absolute() {
    let image = assemble_str(concat!(
        ".data\n.defl word[4] table 1, 2\n",
        ".text\n ld a, $table\n ld b, 0 + $table * 2\n"
    ));
    let obj = parse(&image);
    // $table is the element size, always absolute
    assert_eq!(text_bytes(&image), &[0x3E, 0x02, 0x06, 0x04][..]);
    // four words were laid down, the missing two zero-filled
    assert_eq!(
        &obj.segment_bytes()[4..],
        &[1, 0, 2, 0, 0, 0, 0, 0][..]
    );
}

#[test]
fn expression_stacks_are_bounded() {
    let deep = format!("v = {}1{}\n", "(".repeat(17), ")".repeat(17));
    assert!(try_assemble(&deep).is_err());
}
