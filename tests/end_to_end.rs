//! The six end-to-end scenarios: compiled scripts run against synthetic
//! PNG/WAV/SNA/TGA-shaped inputs, built inline since no fixture directory
//! was seeded for this port (see `DESIGN.md`).

use bitscript::{BitOrder, Field, ParseFlags, Parser};

fn ascii_be(s: &str) -> i32 {
    let b = s.as_bytes();
    ((b[0] as i32) << 24) | ((b[1] as i32) << 16) | ((b[2] as i32) << 8) | (b[3] as i32)
}

fn ascii_le(s: &str) -> i32 {
    let b = s.as_bytes();
    (b[0] as i32) | ((b[1] as i32) << 8) | ((b[2] as i32) << 16) | ((b[3] as i32) << 24)
}

#[test]
fn png_whole_stream_chunks() {
    let script = "long header; chunk[_]{int length; int type; byte[length] data; int crc;}";
    let parser = Parser::prepare(script, &[]).unwrap();

    let chunks = [
        ("IHDR", 0x0Du32),
        ("gAMA", 0x04),
        ("bKGD", 0x06),
        ("pHYs", 0x09),
        ("tIME", 0x07),
        ("tEXt", 0x19),
        ("IDAT", 0x0E5F),
        ("IEND", 0x00),
    ];

    let mut data = Vec::new();
    data.extend_from_slice(&0x89504E470D0A1A0Au64.to_be_bytes());
    for &(ty, len) in &chunks {
        data.extend_from_slice(&len.to_be_bytes());
        data.extend_from_slice(ty.as_bytes());
        data.extend((0..len).map(|i| (i % 256) as u8));
        data.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
    }

    let root = parser
        .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap();

    assert_eq!(
        Some(0x89504E470D0A1A0Au64 as i64),
        root.by_name("header").and_then(Field::as_i64)
    );

    let Some(Field::ArrayStruct(entries)) = root.by_name("chunk") else {
        panic!("expected chunk to be an ArrayStruct");
    };
    assert_eq!(chunks.len(), entries.len());
    for (entry, &(ty, len)) in entries.iter().zip(chunks.iter()) {
        assert_eq!(Some(len as i64), entry.by_name("length").and_then(Field::as_i64));
        assert_eq!(
            Some(ascii_be(ty) as i64),
            entry.by_name("type").and_then(Field::as_i64)
        );
        assert_eq!(Some(len as usize), entry.by_name("data").and_then(Field::array_len));
    }

    let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
    assert_eq!(data, out);
}

#[test]
fn wav_little_endian_subchunks() {
    let script = "<int ChunkID; <int ChunkSize; <int Format; \
                   SubChunks[_]{<int SubChunkID; <int SubChunkSize; byte[SubChunkSize] data; align:2;}";
    let parser = Parser::prepare(script, &[]).unwrap();

    let subchunks: [(&str, u32); 5] =
        [("fmt ", 16), ("fact", 4), ("data", 10), ("afsp", 7), ("LIST", 4)];
    let chunk_size: u32 = 4 + subchunks
        .iter()
        .map(|&(_, size)| size + 8 + (size & 1))
        .sum::<u32>();

    let mut data = Vec::new();
    data.extend_from_slice(b"RIFF");
    data.extend_from_slice(&chunk_size.to_le_bytes());
    data.extend_from_slice(b"WAVE");
    for &(id, size) in &subchunks {
        data.extend_from_slice(id.as_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data.extend((0..size).map(|i| (i as u8).wrapping_add(1)));
        if size % 2 == 1 {
            data.push(0);
        }
    }

    let root = parser
        .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap();

    assert_eq!(Some(0x46464952), root.by_name("ChunkID").and_then(Field::as_i64).map(|v| v as i32));
    assert_eq!(Some(0x45564157), root.by_name("Format").and_then(Field::as_i64).map(|v| v as i32));
    assert_eq!(Some(chunk_size as i64), root.by_name("ChunkSize").and_then(Field::as_i64));

    let Some(Field::ArrayStruct(entries)) = root.by_name("SubChunks") else {
        panic!("expected SubChunks to be an ArrayStruct");
    };
    assert_eq!(subchunks.len(), entries.len());
    for (entry, &(id, size)) in entries.iter().zip(subchunks.iter()) {
        assert_eq!(
            Some(ascii_le(id) as i64),
            entry.by_name("SubChunkID").and_then(Field::as_i64)
        );
        assert_eq!(Some(size as i64), entry.by_name("SubChunkSize").and_then(Field::as_i64));
        assert_eq!(Some(size as usize), entry.by_name("data").and_then(Field::array_len));
    }

    let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
    assert_eq!(data, out);
}

#[test]
fn sna_zx_spectrum_snapshot() {
    let script = "<ushort altHL; <ushort altDE; <ushort altBC; <ushort altAF; \
                   <ushort regHL; <ushort regDE; <ushort regBC; <ushort regIY; <ushort regIX; \
                   <ushort regAF; <ushort regSP; <ushort reserved1; <ushort reserved2; \
                   ubyte regI; ubyte iff2; ubyte regR; ubyte im; ubyte borderColor; ubyte reserved3; \
                   byte[49152] ramDump;";
    let parser = Parser::prepare(script, &[]).unwrap();

    let ushorts: [u16; 13] = [
        0x2758, 0x369B, 0x1721, 0x0044, 0x2D2B, 0x1111, 0x2222, 0x3333, 0x4444, 0x5555, 0x7E62,
        0x0000, 0x0000,
    ];
    let ubytes: [u8; 6] = [0x3F, 0x01, 0x00, 0x01, 0x07, 0x00];

    let mut data = Vec::new();
    for v in ushorts {
        data.extend_from_slice(&v.to_le_bytes());
    }
    data.extend_from_slice(&ubytes);
    data.extend((0..49152u32).map(|i| (i % 256) as u8));

    let root = parser
        .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap();

    assert_eq!(Some(0x3F), root.by_name("regI").and_then(Field::as_i64));
    assert_eq!(Some(0x2758), root.by_name("altHL").and_then(Field::as_i64));
    assert_eq!(Some(0x369B), root.by_name("altDE").and_then(Field::as_i64));
    assert_eq!(Some(0x1721), root.by_name("altBC").and_then(Field::as_i64));
    assert_eq!(Some(0x0044), root.by_name("altAF").and_then(Field::as_i64));
    assert_eq!(Some(0x2D2B), root.by_name("regHL").and_then(Field::as_i64));
    assert_eq!(Some(0x7E62), root.by_name("regSP").and_then(Field::as_i64));
    assert_eq!(Some(0x01), root.by_name("im").and_then(Field::as_i64));
    assert_eq!(Some(0x07), root.by_name("borderColor").and_then(Field::as_i64));
    assert_eq!(Some(49152), root.by_name("ramDump").and_then(Field::array_len));

    let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
    assert_eq!(data, out);
}

#[test]
fn tga_with_color_map() {
    let script = "Header{ \
                      ubyte IDLength; ubyte ColorMapType; ubyte ImageType; \
                      <ushort CMapStart; <ushort CMapLength; ubyte CMapDepth; \
                      <ushort XOffset; <ushort YOffset; <ushort Width; <ushort Height; \
                      ubyte PixelDepth; \
                      ImageDesc{ bit:4 PixelAttrNumber; bit:2 Pos; bit:2 Reserved; } \
                  } \
                  byte[Header.IDLength] ImageID; \
                  ColorMap[(Header.ColorMapType & 1) * Header.CMapLength]{ \
                      byte[Header.CMapDepth >>> 3] ColorMapItem; \
                  } \
                  byte[_] ImageData;";
    let parser = Parser::prepare(script, &[]).unwrap();

    let id_length = 0u8;
    let color_map_type = 1u8;
    let image_type = 1u8;
    let cmap_start = 0u16;
    let cmap_length = 256u16;
    let cmap_depth = 24u8;
    let width = 640u16;
    let height = 480u16;
    let pixel_depth = 8u8;
    let image_desc: u8 = (0 << 4) | (2 << 2) | 0; // PixelAttrNumber=0, Pos=2, Reserved=0
    let color_map_count = (color_map_type as u32 & 1) * cmap_length as u32;
    let color_map_item_width = (cmap_depth >> 3) as u32;
    let image_data_len = 155_403usize;

    let mut data = Vec::new();
    data.push(id_length);
    data.push(color_map_type);
    data.push(image_type);
    data.extend_from_slice(&cmap_start.to_le_bytes());
    data.extend_from_slice(&cmap_length.to_le_bytes());
    data.push(cmap_depth);
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.push(pixel_depth);
    data.push(image_desc);
    // No image ID bytes (IDLength == 0).
    for i in 0..color_map_count {
        for j in 0..color_map_item_width {
            data.push(((i * color_map_item_width + j) % 256) as u8);
        }
    }
    data.extend((0..image_data_len).map(|i| (i % 256) as u8));

    let root = parser
        .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap();

    assert_eq!(Some(640), root.by_path("Header.Width").and_then(Field::as_i64));
    assert_eq!(Some(480), root.by_path("Header.Height").and_then(Field::as_i64));
    assert_eq!(Some(8), root.by_path("Header.PixelDepth").and_then(Field::as_i64));
    assert_eq!(
        Some(0),
        root.by_path("Header.ImageDesc.PixelAttrNumber").and_then(Field::as_i64)
    );
    assert_eq!(Some(2), root.by_path("Header.ImageDesc.Pos").and_then(Field::as_i64));
    assert_eq!(Some(256), root.by_name("ColorMap").and_then(Field::array_len));
    assert_eq!(Some(image_data_len), root.by_name("ImageData").and_then(Field::array_len));

    let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
    assert_eq!(data, out);
}

#[test]
fn whole_stream_bit_array_round_trips() {
    let parser = Parser::prepare("bit[_] bitArray;", &[]).unwrap();
    let data: Vec<u8> = (0..1024u32).map(|i| ((i * 167) + 13) as u8).collect();

    let root = parser
        .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap();
    assert_eq!(Some(8 * 1024), root.by_name("bitArray").and_then(Field::array_len));

    let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
    assert_eq!(data, out);
}

#[test]
fn skip_remaining_fields_if_eof_yields_truncated_tree_at_prefix_boundary() {
    let parser = Parser::prepare("int a; int b; int c;", &[]).unwrap();
    // Exactly two whole `int`s, then nothing -- an instruction boundary.
    let prefix = [0, 0, 0, 1, 0, 0, 0, 2];

    let outcome = parser
        .parse(&prefix, BitOrder::Msb0, None, None, None, ParseFlags::SKIP_REMAINING_FIELDS_IF_EOF)
        .unwrap();

    assert_eq!(Some(1), outcome.by_name("a").and_then(Field::as_i64));
    assert_eq!(Some(2), outcome.by_name("b").and_then(Field::as_i64));
    assert!(outcome.by_name("c").is_none());
    assert_eq!(prefix.len() as i64, outcome.final_stream_byte_counter);

    // Without the flag the same truncated prefix is a hard error.
    let err = parser
        .parse(&prefix, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap_err();
    assert!(matches!(err, bitscript::ParsingError::Interp(_)));
}

#[test]
fn counted_zero_struct_array_is_empty_and_advances_cleanly() {
    let parser = Parser::prepare("S[0]{ int a; }", &[]).unwrap();
    let data = [1, 2, 3, 4, 5, 6, 7, 8];

    let root = parser
        .parse(&data, BitOrder::Msb0, None, None, None, ParseFlags::empty())
        .unwrap();
    assert_eq!(Some(0), root.by_name("S").and_then(Field::array_len));

    let out = parser.emit(&root, BitOrder::Msb0, None, None).unwrap();
    assert!(out.is_empty());
}
