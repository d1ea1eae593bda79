#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use otapply::format::{compression, zucchini::PatchHeader};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = PatchHeader::parse(data);

                if let Ok(patch) = compression::brotli_decode(data, 1024 * 1024) {
                    let _ = PatchHeader::parse(&patch);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
