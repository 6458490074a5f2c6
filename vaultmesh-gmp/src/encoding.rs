//! ABI encoding/decoding for rebalancing messages
//!
//! Every field is a 32-byte big-endian word, matching Solidity ABI encoding of
//! `uint64`/`uint8` values so EVM receivers can `abi.decode` the body directly.

use crate::{
    Acknowledgement, AllocationInstruction, BalanceReport, BalanceRequest, Direction, GmpError,
};

/// Size of one ABI word
pub const WORD: usize = 32;

fn push_u64(encoded: &mut Vec<u8>, value: u64) {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&value.to_be_bytes());
    encoded.extend_from_slice(&word);
}

fn push_u8(encoded: &mut Vec<u8>, value: u8) {
    let mut word = [0u8; WORD];
    word[31] = value;
    encoded.extend_from_slice(&word);
}

/// Sequential reader over ABI words
struct WordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WordReader<'a> {
    fn new(bytes: &'a [u8], words: usize, what: &str) -> Result<Self, GmpError> {
        if bytes.len() < words * WORD {
            return Err(GmpError::Decoding(format!(
                "{} payload too short: {} < {}",
                what,
                bytes.len(),
                words * WORD
            )));
        }
        Ok(Self { bytes, offset: 0 })
    }

    fn word(&mut self) -> &'a [u8] {
        let word = &self.bytes[self.offset..self.offset + WORD];
        self.offset += WORD;
        word
    }

    fn u64(&mut self) -> Result<u64, GmpError> {
        let word = self.word();
        if word[..24].iter().any(|b| *b != 0) {
            return Err(GmpError::Decoding("uint64 word overflows".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&word[24..]);
        Ok(u64::from_be_bytes(buf))
    }

    fn u8(&mut self) -> Result<u8, GmpError> {
        let word = self.word();
        if word[..31].iter().any(|b| *b != 0) {
            return Err(GmpError::Decoding("uint8 word overflows".into()));
        }
        Ok(word[31])
    }
}

/// Encode a balance request: round_id (32) + reply_chain (32)
pub fn encode_balance_request(request: &BalanceRequest) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(2 * WORD);
    push_u64(&mut encoded, request.round_id);
    push_u64(&mut encoded, request.reply_chain);
    encoded
}

pub fn decode_balance_request(bytes: &[u8]) -> Result<BalanceRequest, GmpError> {
    let mut reader = WordReader::new(bytes, 2, "balance request")?;
    Ok(BalanceRequest {
        round_id: reader.u64()?,
        reply_chain: reader.u64()?,
    })
}

/// Encode a balance report: round_id (32) + chain_id (32) + amount (32)
pub fn encode_balance_report(report: &BalanceReport) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(3 * WORD);
    push_u64(&mut encoded, report.round_id);
    push_u64(&mut encoded, report.chain_id);
    push_u64(&mut encoded, report.amount);
    encoded
}

pub fn decode_balance_report(bytes: &[u8]) -> Result<BalanceReport, GmpError> {
    let mut reader = WordReader::new(bytes, 3, "balance report")?;
    Ok(BalanceReport {
        round_id: reader.u64()?,
        chain_id: reader.u64()?,
        amount: reader.u64()?,
    })
}

/// Encode an instruction: round_id + chain_id + target_amount + direction
pub fn encode_instruction(instruction: &AllocationInstruction) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(4 * WORD);
    push_u64(&mut encoded, instruction.round_id);
    push_u64(&mut encoded, instruction.chain_id);
    push_u64(&mut encoded, instruction.target_amount);
    push_u8(&mut encoded, instruction.direction as u8);
    encoded
}

pub fn decode_instruction(bytes: &[u8]) -> Result<AllocationInstruction, GmpError> {
    let mut reader = WordReader::new(bytes, 4, "instruction")?;
    Ok(AllocationInstruction {
        round_id: reader.u64()?,
        chain_id: reader.u64()?,
        target_amount: reader.u64()?,
        direction: Direction::try_from(reader.u8()?)?,
    })
}

/// Encode an acknowledgement: round_id + chain_id + target_amount + achieved_amount
pub fn encode_acknowledgement(ack: &Acknowledgement) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(4 * WORD);
    push_u64(&mut encoded, ack.round_id);
    push_u64(&mut encoded, ack.chain_id);
    push_u64(&mut encoded, ack.target_amount);
    push_u64(&mut encoded, ack.achieved_amount);
    encoded
}

pub fn decode_acknowledgement(bytes: &[u8]) -> Result<Acknowledgement, GmpError> {
    let mut reader = WordReader::new(bytes, 4, "acknowledgement")?;
    Ok(Acknowledgement {
        round_id: reader.u64()?,
        chain_id: reader.u64()?,
        target_amount: reader.u64()?,
        achieved_amount: reader.u64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_layout() {
        let report = BalanceReport {
            round_id: 7,
            chain_id: 8453,
            amount: 2_500_000,
        };

        let encoded = encode_balance_report(&report);
        assert_eq!(encoded.len(), 3 * WORD);
        assert_eq!(&encoded[24..32], &7u64.to_be_bytes());
        assert_eq!(decode_balance_report(&encoded).unwrap(), report);
    }

    #[test]
    fn test_short_payload_rejected() {
        let err = decode_acknowledgement(&[0u8; 3 * WORD]).unwrap_err();
        assert!(err.to_string().contains("acknowledgement payload too short"));
    }

    #[test]
    fn test_oversized_word_rejected() {
        let mut encoded = encode_balance_request(&BalanceRequest {
            round_id: 1,
            reply_chain: 1,
        });
        encoded[0] = 0xff;
        assert!(decode_balance_request(&encoded).is_err());
    }

    #[test]
    fn test_unknown_direction_rejected() {
        let mut encoded = encode_instruction(&AllocationInstruction {
            round_id: 1,
            chain_id: 10,
            target_amount: 5,
            direction: Direction::Hold,
        });
        let last = encoded.len() - 1;
        encoded[last] = 7;
        assert!(matches!(
            decode_instruction(&encoded),
            Err(GmpError::InvalidDirection(7))
        ));
    }
}
