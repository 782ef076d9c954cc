// Basic Binary Block Format (B3F)
//
// File Format
// [4] magic number encoded as u32 (0xBB33FF00)
// [4] file tag (arbitrary 4 bytes for user)
// [4] version (arbitrary meaning for user, encoded as u32)
// [4] block count (encoded as u32)
// [8] bytes indicating 0 (0x00)
// [8*n] ending offset of block
// [x] pad to 16 byte offset
// [n*len(n)] data (format/encoding/semantics would be implied by file tag). Each block begins at
// [x] pad to 16 byte offset
//
// All integers are little-endian so that files written by a worker process can be read by the
// process that launched it regardless of how either was built.
//
// The offset table is an array of u64 of n+1 length where n is number of blocks. Block n begins
// at array[n] rounded up to 16 bytes and ends at array[n+1].

use std::convert::TryInto;
use std::io::Write;

pub const B3F_MAGIC: u32 = 0xBB33FF00;

const HEADER_SIZE_IN_BYTES: usize = 16;
const BLOCK_LENGTH_SIZE_IN_BYTES: usize = 8;
const BLOCK_ALIGNMENT_IN_BYTES: usize = 16;

fn align_up(offset: usize) -> usize {
    ((offset + BLOCK_ALIGNMENT_IN_BYTES - 1) / BLOCK_ALIGNMENT_IN_BYTES) * BLOCK_ALIGNMENT_IN_BYTES
}

fn data_offset(block_count: usize) -> usize {
    align_up(HEADER_SIZE_IN_BYTES + ((block_count + 1) * BLOCK_LENGTH_SIZE_IN_BYTES))
}

pub struct B3FWriter<'a> {
    file_tag: u32,
    version: u32,
    blocks: Vec<&'a [u8]>,
}

impl<'a> B3FWriter<'a> {
    pub fn new_from_u8_tag(
        file_tag: [u8; 4],
        version: u32,
    ) -> Self {
        B3FWriter {
            file_tag: u32::from_le_bytes(file_tag),
            version,
            blocks: Vec::default(),
        }
    }

    pub fn add_block(
        &mut self,
        data: &'a [u8],
    ) {
        self.blocks.push(data);
    }

    pub fn write<W: Write>(
        &self,
        mut writer: W,
    ) -> std::io::Result<()> {
        //
        // 16 byte header
        //
        writer.write_all(&B3F_MAGIC.to_le_bytes())?;
        writer.write_all(&self.file_tag.to_le_bytes())?;
        writer.write_all(&self.version.to_le_bytes())?;
        let block_count = self.blocks.len() as u32;
        writer.write_all(&block_count.to_le_bytes())?;

        //
        // A single u64 zero + N u64 block end positions
        //
        writer.write_all(&0u64.to_le_bytes())?;

        let mut block_begin = 0;
        for block in &self.blocks {
            let block_end = block_begin + block.len();
            writer.write_all(&(block_end as u64).to_le_bytes())?;

            // Realign to 16 bytes, this is where the next block begins
            block_begin = align_up(block_end);
        }

        //
        // Pad block 0 to start at a 16 byte offset
        //
        let table_end = HEADER_SIZE_IN_BYTES + ((self.blocks.len() + 1) * BLOCK_LENGTH_SIZE_IN_BYTES);
        if table_end % 16 == 8 {
            writer.write_all(&0u64.to_le_bytes())?;
        } else {
            assert!(table_end % 16 == 0);
        }

        //
        // Write the blocks
        //
        const PADDING: [u8; BLOCK_ALIGNMENT_IN_BYTES] = [0; BLOCK_ALIGNMENT_IN_BYTES];
        for block in &self.blocks {
            writer.write_all(block)?;
            if block.len() % BLOCK_ALIGNMENT_IN_BYTES != 0 {
                let required_padding = BLOCK_ALIGNMENT_IN_BYTES - block.len() % BLOCK_ALIGNMENT_IN_BYTES;
                writer.write_all(&PADDING[0..required_padding])?;
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::default();
        // Writing into a Vec can't fail
        let _ = self.write(&mut bytes);
        bytes
    }
}

pub struct B3FReader<'a> {
    data: &'a [u8],
}

impl<'a> B3FReader<'a> {
    /// Returns None if the data is not a complete B3F file. Every block range is validated here so
    /// `get_block` can't go out of bounds on a truncated or corrupt file.
    pub fn new(data: &'a [u8]) -> Option<B3FReader<'a>> {
        if data.len() < HEADER_SIZE_IN_BYTES {
            return None;
        }

        let magic_number = u32::from_le_bytes(data[0..4].try_into().ok()?);
        if magic_number != B3F_MAGIC {
            return None;
        }

        let reader = B3FReader { data };
        let block_count = reader.block_count();
        let table_end = HEADER_SIZE_IN_BYTES + (block_count + 1) * BLOCK_LENGTH_SIZE_IN_BYTES;
        if data.len() < table_end {
            return None;
        }

        let blocks_begin = data_offset(block_count);
        let mut previous_end = 0;
        for index in 0..block_count {
            let end = reader.block_end_offset(index + 1)?;
            if end < align_up(previous_end) || blocks_begin + end > data.len() {
                return None;
            }
            previous_end = end;
        }

        Some(reader)
    }

    pub fn file_tag_as_u8(&self) -> &[u8] {
        &self.data[4..8]
    }

    pub fn version(&self) -> u32 {
        u32::from_le_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn block_count(&self) -> usize {
        u32::from_le_bytes([self.data[12], self.data[13], self.data[14], self.data[15]]) as usize
    }

    fn block_end_offset(
        &self,
        table_index: usize,
    ) -> Option<usize> {
        let offset = HEADER_SIZE_IN_BYTES + (table_index * BLOCK_LENGTH_SIZE_IN_BYTES);
        let bytes = self.data.get(offset..offset + BLOCK_LENGTH_SIZE_IN_BYTES)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?) as usize)
    }

    pub fn get_block(
        &self,
        index: usize,
    ) -> &'a [u8] {
        assert!(index < self.block_count());
        // Offsets were validated in new()
        let begin = align_up(self.block_end_offset(index).unwrap_or(0));
        let end = self.block_end_offset(index + 1).unwrap_or(begin);
        let data_offset = data_offset(self.block_count());
        &self.data[data_offset..][begin..end]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_survive_write_and_read() {
        let first = b"seventeen bytes!!".to_vec();
        let second = Vec::<u8>::new();
        let third = vec![7u8; 33];

        let mut writer = B3FWriter::new_from_u8_tag(*b"TEST", 3);
        writer.add_block(&first);
        writer.add_block(&second);
        writer.add_block(&third);
        let bytes = writer.to_bytes();

        let reader = B3FReader::new(&bytes).unwrap();
        assert_eq!(reader.file_tag_as_u8(), b"TEST");
        assert_eq!(reader.version(), 3);
        assert_eq!(reader.block_count(), 3);
        assert_eq!(reader.get_block(0), &first[..]);
        assert_eq!(reader.get_block(1), &second[..]);
        assert_eq!(reader.get_block(2), &third[..]);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let payload = vec![1u8; 40];
        let mut writer = B3FWriter::new_from_u8_tag(*b"TEST", 1);
        writer.add_block(&payload);
        let bytes = writer.to_bytes();

        assert!(B3FReader::new(&bytes[..bytes.len() - 20]).is_none());
        assert!(B3FReader::new(&bytes[..8]).is_none());

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xFF;
        assert!(B3FReader::new(&bad_magic).is_none());
    }
}
