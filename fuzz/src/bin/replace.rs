#[cfg(not(windows))]
mod fuzz {
    use std::io::{Cursor, Write};

    use honggfuzz::fuzz;
    use otapply::format::compression::{CompressedFormat, DecodingWriter};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                for format in [CompressedFormat::Bzip2, CompressedFormat::Xz] {
                    let Ok(mut writer) = DecodingWriter::new(Cursor::new(Vec::new()), format)
                    else {
                        continue;
                    };
                    if writer.write_all(data).is_ok() {
                        let _ = writer.finish();
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
