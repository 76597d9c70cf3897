//! Hardware integration layer.

pub mod storage;

pub fn init() {
    storage::init();
}
