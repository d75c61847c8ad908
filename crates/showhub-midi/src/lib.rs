//! Stateful MIDI byte-stream parser (spec §4.7).
//!
//! Consumes raw MIDI bytes fed in arbitrary-sized chunks and emits typed
//! events. Running status and the per-channel NRPN accumulator are the two
//! pieces of cross-call state; everything else about a message is decided
//! from the bytes in hand.

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    Nrpn { channel: u8, param_msb: u8, param_lsb: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
}

#[derive(Debug, Clone, Copy, Default)]
struct NrpnAccumulator {
    msb: Option<u8>,
    lsb: Option<u8>,
}

/// One parser per MIDI source. Not `Clone` — its accumulator state is only
/// meaningful for a single ordered byte stream.
pub struct MidiParser {
    last_status: Option<u8>,
    buffer: Vec<u8>,
    nrpn: [NrpnAccumulator; 16],
}

impl MidiParser {
    pub fn new() -> Self {
        Self {
            last_status: None,
            buffer: Vec::with_capacity(2),
            nrpn: [NrpnAccumulator::default(); 16],
        }
    }

    /// Feed an arbitrary slice of bytes, however it happens to be chunked.
    /// Feeding the same overall stream one byte at a time or all at once
    /// produces the same events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MidiEvent> {
        let mut out = Vec::new();
        for &byte in bytes {
            self.feed_byte(byte, &mut out);
        }
        out
    }

    fn feed_byte(&mut self, byte: u8, out: &mut Vec<MidiEvent>) {
        // System real-time: transparent, never disturbs a message in flight.
        if byte >= 0xF8 {
            return;
        }
        // System common / SysEx: resets running status, abandons any partial
        // message. We don't attempt to parse these bodies.
        if (0xF0..=0xF7).contains(&byte) {
            self.last_status = None;
            self.buffer.clear();
            return;
        }
        // Status byte: starts a new message, becomes the running status.
        if byte & 0x80 != 0 {
            self.last_status = Some(byte);
            self.buffer.clear();
            return;
        }
        // Data byte: attach to the in-flight message, or to running status
        // if none is in flight. With no running status, it's an orphan.
        let Some(status) = self.last_status else {
            trace!(byte, "dropping data byte with no running status");
            return;
        };
        self.buffer.push(byte);
        let needed = data_len(status);
        if self.buffer.len() < needed {
            return;
        }
        let data = std::mem::take(&mut self.buffer);
        self.dispatch(status, &data, out);
    }

    fn dispatch(&mut self, status: u8, data: &[u8], out: &mut Vec<MidiEvent>) {
        let channel = status & 0x0F;
        match status & 0xF0 {
            0x90 => out.push(MidiEvent::NoteOn {
                channel,
                note: data[0],
                velocity: data[1],
            }),
            0xB0 => self.dispatch_control_change(channel, data[0], data[1], out),
            0xC0 => out.push(MidiEvent::ProgramChange {
                channel,
                program: data[0],
            }),
            // Note off, polyphonic/channel aftertouch, pitch bend: discarded.
            _ => {}
        }
    }

    fn dispatch_control_change(&mut self, channel: u8, controller: u8, value: u8, out: &mut Vec<MidiEvent>) {
        let accum = &mut self.nrpn[channel as usize];
        match controller {
            99 => {
                accum.msb = Some(value);
                accum.lsb = None;
            }
            98 => accum.lsb = Some(value),
            6 => {
                if let (Some(msb), Some(lsb)) = (accum.msb, accum.lsb) {
                    out.push(MidiEvent::Nrpn {
                        channel,
                        param_msb: msb,
                        param_lsb: lsb,
                        value,
                    });
                }
            }
            _ => {}
        }
    }
}

impl Default for MidiParser {
    fn default() -> Self {
        Self::new()
    }
}

fn data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_nrpn_sequence_emits_one_event() {
        let mut p = MidiParser::new();
        let events = p.feed(&[0xBB, 99, 0x05, 0xBB, 98, 0x17, 0xBB, 6, 0x64]);
        assert_eq!(
            events,
            vec![MidiEvent::Nrpn {
                channel: 11,
                param_msb: 0x05,
                param_lsb: 0x17,
                value: 0x64,
            }]
        );
    }

    #[test]
    fn feed_is_chunk_independent() {
        let stream = [0xBB, 99, 0x05, 0xBB, 98, 0x17, 0xBB, 6, 0x64];

        let mut whole = MidiParser::new();
        let whole_events = whole.feed(&stream);

        let mut byte_at_a_time = MidiParser::new();
        let mut split_events = Vec::new();
        for b in stream {
            split_events.extend(byte_at_a_time.feed(&[b]));
        }

        assert_eq!(whole_events, split_events);
        assert_eq!(split_events.len(), 1);
    }

    #[test]
    fn system_realtime_bytes_are_transparent() {
        let mut plain = MidiParser::new();
        let plain_events = plain.feed(&[0xBB, 99, 0x05, 0xBB, 98, 0x17, 0xBB, 6, 0x64]);

        let mut interleaved = MidiParser::new();
        let interleaved_events = interleaved.feed(&[
            0xF8, 0xBB, 0xFE, 99, 0x05, 0xFF, 0xBB, 98, 0x17, 0xF9, 0xBB, 6, 0xFA, 0x64,
        ]);

        assert_eq!(plain_events, interleaved_events);
    }

    #[test]
    fn running_status_reuses_last_status_byte() {
        let mut p = MidiParser::new();
        let events = p.feed(&[0xBB, 99, 0x05, 0x62, 0x17, 0x06, 0x64]);
        assert_eq!(
            events,
            vec![MidiEvent::Nrpn {
                channel: 11,
                param_msb: 0x05,
                param_lsb: 0x17,
                value: 0x64,
            }]
        );
    }

    #[test]
    fn repeated_data_entry_emits_an_event_per_value_without_clearing() {
        let mut p = MidiParser::new();
        let events = p.feed(&[
            0xB0, 99, 0x0A, // CC99 -> msb = 0x0A
            0xB0, 98, 0x01, // CC98 -> lsb = 0x01
            0xB0, 6, 0x50, // CC6 running: value V1
            6, 0x51, // running status, CC6 again: value V2
        ]);

        assert_eq!(
            events,
            vec![
                MidiEvent::Nrpn { channel: 0, param_msb: 0x0A, param_lsb: 0x01, value: 0x50 },
                MidiEvent::Nrpn { channel: 0, param_msb: 0x0A, param_lsb: 0x01, value: 0x51 },
            ]
        );
    }

    #[test]
    fn sysex_resets_running_status() {
        let mut p = MidiParser::new();
        let events = p.feed(&[
            0xB0, 99, 1, 98, 2, // accumulator primed
            0xF0, 0x7E, 0x00, 0xF7, // sysex, resets running status
            6, 0x42, // orphaned data byte, dropped; no running status anymore
        ]);
        assert!(events.is_empty());
    }

    #[test]
    fn note_on_is_emitted_with_channel_and_velocity() {
        let mut p = MidiParser::new();
        let events = p.feed(&[0x91, 60, 100]);
        assert_eq!(events, vec![MidiEvent::NoteOn { channel: 1, note: 60, velocity: 100 }]);
    }

    #[test]
    fn program_change_is_emitted() {
        let mut p = MidiParser::new();
        let events = p.feed(&[0xC3, 12]);
        assert_eq!(events, vec![MidiEvent::ProgramChange { channel: 3, program: 12 }]);
    }

    #[test]
    fn note_off_and_pitch_bend_are_discarded() {
        let mut p = MidiParser::new();
        let events = p.feed(&[0x80, 60, 0, 0xE0, 0, 64]);
        assert!(events.is_empty());
    }

    #[test]
    fn data_byte_with_no_running_status_is_dropped() {
        let mut p = MidiParser::new();
        let events = p.feed(&[6, 0x42]);
        assert!(events.is_empty());
    }
}
