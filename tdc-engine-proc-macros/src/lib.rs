extern crate proc_macro;
use proc_macro::TokenStream;
use quote::{quote, format_ident};
use syn::parse::{Parse, ParseStream, Result};
use syn::{parse_macro_input, Ident, LitInt, Token};

struct RecordStreamArgs {
    name: Ident,
    record_bytes: LitInt,
}

impl Parse for RecordStreamArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        let name: Ident = input.parse()?;
        input.parse::<Token![,]>()?;
        let record_bytes: LitInt = input.parse()?;

        Ok(RecordStreamArgs {
            name,
            record_bytes,
        })
    }
}

// example use
// #[make_record_stream(Binary, 10)]
// fn parse_record(&mut self, record: &[u8]) -> Option<Event> { ... }
//
// Expands into a `BinaryStream` that reads fixed size records from a file,
// starting at a given data offset, and yields the events returned by
// `parse_record`. Records for which `parse_record` returns `None` are skipped.
#[proc_macro_attribute]
pub fn make_record_stream(args: TokenStream, item: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(item as syn::ItemFn);
    let RecordStreamArgs {
        name,
        record_bytes,
    } = parse_macro_input!(args as RecordStreamArgs);
    let stream_name = format_ident!("{}Stream", name);

    let output = quote!{
        #[allow(dead_code)]
        pub struct #stream_name {
            source: BufReader<std::fs::File>,
            record_buffer: Vec<u8>,
            records_in_buffer: usize,
            cursor: usize,
            skipped_records: usize,
            last_raw_time: u64,
            overflow_correction: i64,
        }

        impl #stream_name {
            pub fn new(mut file: std::fs::File, data_offset: u64) -> Result<Self, Error> {
                file.seek(SeekFrom::Start(data_offset))?;

                Ok(Self {
                    source: BufReader::with_capacity(8 * 1024, file),
                    record_buffer: vec![0; BUFFER_RECORDS * #record_bytes],
                    records_in_buffer: 0,
                    cursor: 0,
                    skipped_records: 0,
                    last_raw_time: 0,
                    overflow_correction: 0,
                })
            }

            /// Number of records that did not decode into an event.
            pub fn skipped_records(&self) -> usize {self.skipped_records}

            fn fill_buffer(&mut self) -> usize {
                let mut filled = 0;
                while filled < self.record_buffer.len() {
                    match self.source.read(&mut self.record_buffer[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("stopped reading records: {}", e);
                            break;
                        }
                    }
                }
                if filled % #record_bytes != 0 {
                    debug!("ignoring {} trailing bytes", filled % #record_bytes);
                }
                self.cursor = 0;
                self.records_in_buffer = filled / #record_bytes;
                self.records_in_buffer
            }
        }

        impl RecordStream for #stream_name {
            #[inline(always)]
            #input
        }

        impl Iterator for #stream_name {
            type Item = Event;

            #[inline(always)]
            fn next(&mut self) -> Option<Self::Item> {
                loop {
                    if self.records_in_buffer == 0 && self.fill_buffer() == 0 {
                        return None;
                    }

                    let start = self.cursor * #record_bytes;
                    let mut record = [0u8; #record_bytes];
                    record.copy_from_slice(&self.record_buffer[start..start + #record_bytes]);
                    self.cursor += 1;
                    self.records_in_buffer -= 1;

                    match self.parse_record(&record) {
                        Some(event) => return Some(event),
                        None => self.skipped_records += 1,
                    }
                }
            }
        }
    };
    output.into()
}
